//! Nearest-centroid labeling.

use std::marker::PhantomData;

use ocl::{Buffer, Context, Device, Event, EventList, Kernel, Queue};

use crate::config::KernelConfig;
use crate::error::{Error, Result};
use crate::measurement::DataPoint;

use super::{build_program, label_define, point_defines, ClLabel, ClPoint};

const SRC: &str = include_str!("cl/labeling.cl");

pub const STRATEGIES: &[&str] = &["naive", "unroll_vector"];

/// Assigns each point of a chunk to its nearest centroid (squared
/// Euclidean distance, ties toward the lower index) and raises the
/// did-changes flag on any label change.
pub struct Labeling<P: ClPoint, L: ClLabel> {
    kernel: Kernel,
    global: usize,
    local: usize,
    _elem: PhantomData<(P, L)>,
}

impl<P: ClPoint, L: ClLabel> Labeling<P, L> {
    pub fn prepare(context: &Context, device: Device, config: &KernelConfig) -> Result<Labeling<P, L>> {
        let kernel_name = match config.strategy.as_str() {
            "naive" => "labeling_naive",
            "unroll_vector" => "labeling_unroll_vector",
            other => {
                return Err(Error::ConfigParse(format!(
                    "unknown labeling strategy `{}` (expected one of {:?})",
                    other, STRATEGIES
                )))
            }
        };

        let mut defines = point_defines::<P>();
        defines.push(label_define::<L>());
        defines.push(format!("-DVEC_LEN={}", config.vector_length.max(1)));
        let program = build_program(context, device, SRC, &defines)?;

        let mut builder = Kernel::builder();
        builder
            .program(&program)
            .name(kernel_name)
            .arg(None::<&Buffer<u8>>) // did_changes
            .arg(0u32)
            .arg(0u32)
            .arg(0u32)
            .arg(None::<&Buffer<u8>>) // points chunk
            .arg(None::<&Buffer<P>>) // centroids
            .arg(None::<&Buffer<u8>>); // labels chunk
        let kernel = unsafe { builder.disable_arg_type_check().build()? };

        Ok(Labeling {
            kernel,
            global: config.global_size[0],
            local: config.local_size[0],
            _elem: PhantomData,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn invoke(
        &self,
        queue: &Queue,
        num_features: usize,
        num_points: usize,
        num_clusters: usize,
        did_changes: &Buffer<u8>,
        points: &Buffer<u8>,
        centroids: &Buffer<P>,
        labels: &Buffer<u8>,
        datapoint: &mut DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        self.kernel.set_arg(0, did_changes)?;
        self.kernel.set_arg(1, num_features as u32)?;
        self.kernel.set_arg(2, num_points as u32)?;
        self.kernel.set_arg(3, num_clusters as u32)?;
        self.kernel.set_arg(4, points)?;
        self.kernel.set_arg(5, centroids)?;
        self.kernel.set_arg(6, labels)?;

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
