//! Centroid-sum accumulation.

use std::cell::RefCell;
use std::marker::PhantomData;

use ocl::flags::MemFlags;
use ocl::{Buffer, Context, Device, Event, EventList, Kernel, Queue};

use crate::config::KernelConfig;
use crate::error::{Error, Result};
use crate::measurement::DataPoint;

use super::reduce::Reduce;
use super::{build_program, label_define, point_defines, ClLabel, ClMass, ClPoint};

const SRC: &str = include_str!("cl/centroid_update.cl");

pub const STRATEGIES: &[&str] = &["feature_sum", "merge_sum"];

enum Strategy<P: ClPoint> {
    FeatureSum,
    MergeSum { partials: Buffer<P>, reduce: Reduce<P> },
}

/// Adds one (points, labels) chunk pair into the per-cluster feature-sum
/// accumulator. The row-wise division by the masses is composed separately
/// by the controller once all chunks are in.
pub struct CentroidUpdate<P: ClPoint, L: ClLabel, M: ClMass> {
    kernel: Kernel,
    strategy: Strategy<P>,
    global: usize,
    local: usize,
    last: RefCell<Option<Event>>,
    _elem: PhantomData<(L, M)>,
}

impl<P: ClPoint, L: ClLabel, M: ClMass> CentroidUpdate<P, L, M> {
    pub fn prepare(
        context: &Context,
        device: Device,
        config: &KernelConfig,
        num_features: usize,
        num_clusters: usize,
    ) -> Result<CentroidUpdate<P, L, M>> {
        let mut defines = point_defines::<P>();
        defines.push(label_define::<L>());

        let global = config.global_size[0];
        let (kernel_name, strategy) = match config.strategy.as_str() {
            "feature_sum" => ("centroid_update_feature_sum", Strategy::FeatureSum),
            "merge_sum" => {
                let partials = Buffer::<P>::builder()
                    .context(context)
                    .flags(MemFlags::new().read_write())
                    .len(global * num_features * num_clusters)
                    .build()?;
                let reduce = Reduce::prepare(context, device, config)?;
                ("centroid_update_merge_sum", Strategy::MergeSum { partials, reduce })
            }
            other => {
                return Err(Error::ConfigParse(format!(
                    "unknown centroid_update strategy `{}` (expected one of {:?})",
                    other, STRATEGIES
                )))
            }
        };

        let program = build_program(context, device, SRC, &defines)?;
        let mut builder = Kernel::builder();
        builder
            .program(&program)
            .name(kernel_name)
            .arg(0u32)
            .arg(0u32)
            .arg(0u32)
            .arg(None::<&Buffer<u8>>) // points chunk
            .arg(None::<&Buffer<u8>>) // labels chunk
            .arg(None::<&Buffer<P>>); // sums or partials
        let kernel = unsafe { builder.disable_arg_type_check().build()? };

        Ok(CentroidUpdate {
            kernel,
            strategy,
            global,
            local: config.local_size[0],
            last: RefCell::new(None),
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
        points: &Buffer<u8>,
        labels: &Buffer<u8>,
        sums: &Buffer<P>,
        datapoint: &mut DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        // Serialize read-modify-write of the shared accumulator.
        let mut wait_all = EventList::new();
        for ev in wait.as_slice() {
            wait_all.push(ev.clone());
        }
        if let Some(prev) = self.last.borrow().as_ref() {
            wait_all.push(prev.clone());
        }

        self.kernel.set_arg(0, num_features as u32)?;
        self.kernel.set_arg(1, num_points as u32)?;
        self.kernel.set_arg(2, num_clusters as u32)?;
        self.kernel.set_arg(3, points)?;
        self.kernel.set_arg(4, labels)?;

        let event = match &self.strategy {
            Strategy::FeatureSum => {
                self.kernel.set_arg(5, sums)?;
                self.launch(queue, datapoint, &wait_all)?
            }
            Strategy::MergeSum { partials, reduce } => {
                self.kernel.set_arg(5, partials)?;
                let partial_event = self.launch(queue, datapoint, &wait_all)?;

                let mut reduce_wait = EventList::new();
                reduce_wait.push(partial_event);
                reduce.invoke(
                    queue,
                    self.global,
                    num_features * num_clusters,
                    partials,
                    sums,
                    datapoint.create_child("CentroidReduce"),
                    &reduce_wait,
                )?
            }
        };

        *self.last.borrow_mut() = Some(event.clone());
        Ok(event)
    }

    fn launch(&self, queue: &Queue, datapoint: &mut DataPoint, wait: &EventList) -> Result<Event> {
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
