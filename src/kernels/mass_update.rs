//! Cluster-mass histogram.

use std::cell::RefCell;
use std::marker::PhantomData;

use ocl::flags::MemFlags;
use ocl::{Buffer, Context, Device, Event, EventList, Kernel, Queue};

use crate::config::KernelConfig;
use crate::error::{Error, Result};
use crate::measurement::DataPoint;

use super::reduce::Reduce;
use super::{build_program, label_define, mass_define, ClLabel, ClMass};

const SRC: &str = include_str!("cl/mass_update.cl");

pub const STRATEGIES: &[&str] = &["global_atomic", "merge"];

enum Strategy<M: ClMass> {
    GlobalAtomic,
    Merge { partials: Buffer<M>, reduce: Reduce<M> },
}

/// Histograms a labels chunk into the per-cluster mass vector.
///
/// Accumulation into the shared mass vector is serialized across chunks by
/// chaining each invocation on the previous one's event (`global_atomic`
/// needs no such chain, its increments commute).
pub struct MassUpdate<L: ClLabel, M: ClMass> {
    kernel: Kernel,
    strategy: Strategy<M>,
    global: usize,
    local: usize,
    last: RefCell<Option<Event>>,
    _elem: PhantomData<L>,
}

impl<L: ClLabel, M: ClMass> MassUpdate<L, M> {
    pub fn prepare(
        context: &Context,
        device: Device,
        config: &KernelConfig,
        num_clusters: usize,
    ) -> Result<MassUpdate<L, M>> {
        let defines = vec![label_define::<L>(), mass_define::<M>()];
        let global = config.global_size[0];
        let (kernel_name, strategy) = match config.strategy.as_str() {
            "global_atomic" => {
                if !M::HAS_GLOBAL_ATOMIC {
                    return Err(Error::ConfigParse(format!(
                        "mass_update strategy `global_atomic` requires a 32-bit mass \
                         type, not `{}`",
                        M::TYPE_NAME
                    )));
                }
                ("mass_update_global_atomic", Strategy::GlobalAtomic)
            }
            "merge" => {
                let partials = Buffer::<M>::builder()
                    .context(context)
                    .flags(MemFlags::new().read_write())
                    .len(global * num_clusters)
                    .build()?;
                let reduce = Reduce::prepare(context, device, config)?;
                ("mass_update_merge", Strategy::Merge { partials, reduce })
            }
            other => {
                return Err(Error::ConfigParse(format!(
                    "unknown mass_update strategy `{}` (expected one of {:?})",
                    other, STRATEGIES
                )))
            }
        };

        let program = build_program(context, device, SRC, &defines)?;
        let mut builder = Kernel::builder();
        builder.program(&program).name(kernel_name).arg(0u32);
        if let Strategy::Merge { .. } = strategy {
            builder.arg(0u32);
        }
        builder.arg(None::<&Buffer<u8>>).arg(None::<&Buffer<M>>);
        let kernel = unsafe { builder.disable_arg_type_check().build()? };

        Ok(MassUpdate {
            kernel,
            strategy,
            global,
            local: config.local_size[0],
            last: RefCell::new(None),
            _elem: PhantomData,
        })
    }

    /// Accumulates one labels chunk into `masses`.
    pub fn invoke(
        &self,
        queue: &Queue,
        num_points: usize,
        num_clusters: usize,
        labels: &Buffer<u8>,
        masses: &Buffer<M>,
        datapoint: &mut DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        let mut wait_all = EventList::new();
        for ev in wait.as_slice() {
            wait_all.push(ev.clone());
        }

        let event = match &self.strategy {
            Strategy::GlobalAtomic => {
                self.kernel.set_arg(0, num_points as u32)?;
                self.kernel.set_arg(1, labels)?;
                self.kernel.set_arg(2, masses)?;
                self.launch(queue, datapoint, &wait_all)?
            }
            Strategy::Merge { partials, reduce } => {
                // Serialize read-modify-write of the shared accumulator.
                if let Some(prev) = self.last.borrow().as_ref() {
                    wait_all.push(prev.clone());
                }

                self.kernel.set_arg(0, num_points as u32)?;
                self.kernel.set_arg(1, num_clusters as u32)?;
                self.kernel.set_arg(2, labels)?;
                self.kernel.set_arg(3, partials)?;
                let partial_event = self.launch(queue, datapoint, &wait_all)?;

                let mut reduce_wait = EventList::new();
                reduce_wait.push(partial_event);
                reduce.invoke(
                    queue,
                    self.global,
                    num_clusters,
                    partials,
                    masses,
                    datapoint.create_child("MassReduce"),
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
