//! Parallel-column reduction.

use std::marker::PhantomData;

use ocl::{Buffer, Context, Device, Event, EventList, Kernel, Queue};

use crate::config::KernelConfig;
use crate::error::Result;
use crate::measurement::DataPoint;

use super::{build_program, point_defines, ClNum};

const SRC: &str = include_str!("cl/reduce.cl");

/// Folds an `num_rows x num_cols` column-major matrix along its rows,
/// adding the column sums into the output vector.
pub struct Reduce<T: ClNum> {
    kernel: Kernel,
    global: usize,
    local: usize,
    _elem: PhantomData<T>,
}

impl<T: ClNum> Reduce<T> {
    pub fn prepare(context: &Context, device: Device, config: &KernelConfig) -> Result<Reduce<T>> {
        // The fp64 pragma rides along whenever the element is double.
        let mut defines = if T::TYPE_NAME == f64::TYPE_NAME {
            point_defines::<f64>()
        } else {
            Vec::new()
        };
        defines.push(format!("-DREDUCE_T={}", T::TYPE_NAME));

        let program = build_program(context, device, SRC, &defines)?;
        let mut builder = Kernel::builder();
        builder
            .program(&program)
            .name("reduce_parallel_column")
            .arg(0u32)
            .arg(0u32)
            .arg(None::<&Buffer<T>>)
            .arg(None::<&Buffer<T>>);
        let kernel = unsafe { builder.disable_arg_type_check().build()? };

        Ok(Reduce {
            kernel,
            global: config.global_size[0],
            local: config.local_size[0],
            _elem: PhantomData,
        })
    }

    pub fn invoke(
        &self,
        queue: &Queue,
        num_rows: usize,
        num_cols: usize,
        matrix: &Buffer<T>,
        out: &Buffer<T>,
        datapoint: &mut DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        self.kernel.set_arg(0, num_rows as u32)?;
        self.kernel.set_arg(1, num_cols as u32)?;
        self.kernel.set_arg(2, matrix)?;
        self.kernel.set_arg(3, out)?;

        let mut event = Event::empty();
        unsafe {
            self.kernel
                .cmd()
                .queue(queue)
                .global_work_size(self.global)
                .local_work_size(self.local)
                .ewait(wait)
                .enew(&mut event)
                .enq()?;
        }
        datapoint.add_event(event.clone());
        Ok(event)
    }
}
