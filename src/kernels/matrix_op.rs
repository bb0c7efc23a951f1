//! Row-wise matrix division.

use std::marker::PhantomData;

use ocl::{Buffer, Context, Device, Event, EventList, Kernel, Queue};

use crate::config::KernelConfig;
use crate::error::Result;
use crate::measurement::DataPoint;

use super::{build_program, mass_define, point_defines, ClMass, ClPoint};

const SRC: &str = include_str!("cl/matrix_op.cl");

/// Divides each row of an `num_rows x num_cols` column-major matrix by the
/// matching divisor element. [`RowDivide::divide`] writes 0 on a zero
/// divisor; [`RowDivide::divide_or_keep`] substitutes the fallback row
/// instead, which keeps an empty cluster's previous centroid.
pub struct RowDivide<P: ClPoint, M: ClMass> {
    divide: Kernel,
    divide_or_keep: Kernel,
    global: usize,
    local: usize,
    _elem: PhantomData<(P, M)>,
}

impl<P: ClPoint, M: ClMass> RowDivide<P, M> {
    pub fn prepare(context: &Context, device: Device, config: &KernelConfig) -> Result<RowDivide<P, M>> {
        let mut defines = point_defines::<P>();
        defines.push(mass_define::<M>());
        let program = build_program(context, device, SRC, &defines)?;

        let mut builder = Kernel::builder();
        builder
            .program(&program)
            .name("row_divide")
            .arg(0u32)
            .arg(0u32)
            .arg(None::<&Buffer<P>>)
            .arg(None::<&Buffer<M>>);
        let divide = unsafe { builder.disable_arg_type_check().build()? };

        let mut builder = Kernel::builder();
        builder
            .program(&program)
            .name("row_divide_or_keep")
            .arg(0u32)
            .arg(0u32)
            .arg(None::<&Buffer<P>>)
            .arg(None::<&Buffer<M>>)
            .arg(None::<&Buffer<P>>);
        let divide_or_keep = unsafe { builder.disable_arg_type_check().build()? };

        Ok(RowDivide {
            divide,
            divide_or_keep,
            global: config.global_size[0],
            local: config.local_size[0],
            _elem: PhantomData,
        })
    }

    pub fn divide(
        &self,
        queue: &Queue,
        num_rows: usize,
        num_cols: usize,
        matrix: &Buffer<P>,
        divisors: &Buffer<M>,
        datapoint: &mut DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        self.divide.set_arg(0, num_rows as u32)?;
        self.divide.set_arg(1, num_cols as u32)?;
        self.divide.set_arg(2, matrix)?;
        self.divide.set_arg(3, divisors)?;
        self.launch(&self.divide, queue, datapoint, wait)
    }

    pub fn divide_or_keep(
        &self,
        queue: &Queue,
        num_rows: usize,
        num_cols: usize,
        matrix: &Buffer<P>,
        divisors: &Buffer<M>,
        fallback: &Buffer<P>,
        datapoint: &mut DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        self.divide_or_keep.set_arg(0, num_rows as u32)?;
        self.divide_or_keep.set_arg(1, num_cols as u32)?;
        self.divide_or_keep.set_arg(2, matrix)?;
        self.divide_or_keep.set_arg(3, divisors)?;
        self.divide_or_keep.set_arg(4, fallback)?;
        self.launch(&self.divide_or_keep, queue, datapoint, wait)
    }

    fn launch(
        &self,
        kernel: &Kernel,
        queue: &Queue,
        datapoint: &mut DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        let mut event = Event::empty();
        unsafe {
            kernel
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
