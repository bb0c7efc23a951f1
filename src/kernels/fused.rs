//! Fused labeling + accumulation.

use std::cell::RefCell;
use std::marker::PhantomData;

use ocl::flags::MemFlags;
use ocl::{Buffer, Context, Device, Event, EventList, Kernel, Queue};

use crate::config::KernelConfig;
use crate::error::{Error, Result};
use crate::measurement::DataPoint;

use super::reduce::Reduce;
use super::{build_program, label_define, mass_define, point_defines, ClLabel, ClMass, ClPoint};

const SRC: &str = include_str!("cl/fused.cl");

pub const STRATEGIES: &[&str] = &["cluster_merge"];

/// One launch per chunk: relabels the chunk against the old centroids and
/// accumulates per-work-item partial centroids and masses, which two
/// chained reductions fold into the iteration accumulators.
pub struct Fused<P: ClPoint, L: ClLabel, M: ClMass> {
    kernel: Kernel,
    centroid_partials: Buffer<P>,
    mass_partials: Buffer<M>,
    reduce_centroids: Reduce<P>,
    reduce_masses: Reduce<M>,
    global: usize,
    local: usize,
    last: RefCell<Option<Event>>,
    _elem: PhantomData<L>,
}

impl<P: ClPoint, L: ClLabel, M: ClMass> Fused<P, L, M> {
    pub fn prepare(
        context: &Context,
        device: Device,
        config: &KernelConfig,
        num_features: usize,
        num_clusters: usize,
    ) -> Result<Fused<P, L, M>> {
        if config.strategy != "cluster_merge" {
            return Err(Error::ConfigParse(format!(
                "unknown fused strategy `{}` (expected one of {:?})",
                config.strategy, STRATEGIES
            )));
        }

        let mut defines = point_defines::<P>();
        defines.push(label_define::<L>());
        defines.push(mass_define::<M>());

        let global = config.global_size[0];
        let centroid_partials = Buffer::<P>::builder()
            .context(context)
            .flags(MemFlags::new().read_write())
            .len(global * num_features * num_clusters)
            .build()?;
        let mass_partials = Buffer::<M>::builder()
            .context(context)
            .flags(MemFlags::new().read_write())
            .len(global * num_clusters)
            .build()?;
        let reduce_centroids = Reduce::prepare(context, device, config)?;
        let reduce_masses = Reduce::prepare(context, device, config)?;

        let program = build_program(context, device, SRC, &defines)?;
        let mut builder = Kernel::builder();
        builder
            .program(&program)
            .name("fused_cluster_merge")
            .arg(None::<&Buffer<u8>>) // did_changes
            .arg(0u32)
            .arg(0u32)
            .arg(0u32)
            .arg(None::<&Buffer<u8>>) // points chunk
            .arg(None::<&Buffer<P>>) // old centroids
            .arg(None::<&Buffer<u8>>) // labels chunk
            .arg(None::<&Buffer<P>>) // centroid partials
            .arg(None::<&Buffer<M>>); // mass partials
        let kernel = unsafe { builder.disable_arg_type_check().build()? };

        Ok(Fused {
            kernel,
            centroid_partials,
            mass_partials,
            reduce_centroids,
            reduce_masses,
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
        did_changes: &Buffer<u8>,
        points: &Buffer<u8>,
        old_centroids: &Buffer<P>,
        labels: &Buffer<u8>,
        centroid_sums: &Buffer<P>,
        masses: &Buffer<M>,
        datapoint: &mut DataPoint,
        wait: &EventList,
    ) -> Result<Event> {
        // The partial buffers and both accumulators are shared across
        // chunks; chain on the previous invocation.
        let mut wait_all = EventList::new();
        for ev in wait.as_slice() {
            wait_all.push(ev.clone());
        }
        if let Some(prev) = self.last.borrow().as_ref() {
            wait_all.push(prev.clone());
        }

        self.kernel.set_arg(0, did_changes)?;
        self.kernel.set_arg(1, num_features as u32)?;
        self.kernel.set_arg(2, num_points as u32)?;
        self.kernel.set_arg(3, num_clusters as u32)?;
        self.kernel.set_arg(4, points)?;
        self.kernel.set_arg(5, old_centroids)?;
        self.kernel.set_arg(6, labels)?;
        self.kernel.set_arg(7, &self.centroid_partials)?;
        self.kernel.set_arg(8, &self.mass_partials)?;

        let mut kernel_event = Event::empty();
        unsafe {
            self.kernel
                .cmd()
                .queue(queue)
                .global_work_size(self.global)
                .local_work_size(self.local)
                .ewait(&wait_all)
                .enew(&mut kernel_event)
                .enq()?;
        }
        datapoint.add_event(kernel_event.clone());

        let mut reduce_wait = EventList::new();
        reduce_wait.push(kernel_event);
        let centroids_event = self.reduce_centroids.invoke(
            queue,
            self.global,
            num_features * num_clusters,
            &self.centroid_partials,
            centroid_sums,
            datapoint.create_child("CentroidReduce"),
            &reduce_wait,
        )?;

        reduce_wait.push(centroids_event);
        let event = self.reduce_masses.invoke(
            queue,
            self.global,
            num_clusters,
            &self.mass_partials,
            masses,
            datapoint.create_child("MassReduce"),
            &reduce_wait,
        )?;

        *self.last.borrow_mut() = Some(event.clone());
        Ok(event)
    }
}
