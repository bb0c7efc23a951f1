//! The three-stage iteration controller: labeling, mass update and
//! centroid update as separate kernel passes per iteration.

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;
use std::slice;
use std::time::Instant;

use log::debug;
use ocl::{Buffer, Event, EventList};

use crate::cache::{BufferCache, ObjectMode, DEFAULT_BUFFER_SIZE};
use crate::config::{Config, KernelConfig, PipelineKind};
use crate::error::{Error, Result};
use crate::kernels::{CentroidUpdate, ClLabel, ClMass, ClPoint, Labeling, MassUpdate, RowDivide};
use crate::matrix::{first_k_centroids, partition_tiles, Matrix};
use crate::measurement::{DataPoint, Measurement};
use crate::scheduler::{BinaryFn, Scheduler, UnaryFn};

use super::{
    chunk_geometry, fill_zero, open_device, pool_budget, DeviceHandle, KmeansPipeline, RunOutput,
};

struct Adapters<P: ClPoint, L: ClLabel, M: ClMass> {
    labeling: Rc<Labeling<P, L>>,
    mass: Rc<MassUpdate<L, M>>,
    centroid: Rc<CentroidUpdate<P, L, M>>,
    divide: RowDivide<P, M>,
}

/// See the module documentation.
pub struct ThreeStagePipeline<P: ClPoint, L: ClLabel, M: ClMass> {
    handle: DeviceHandle,
    labeling_config: KernelConfig,
    mass_config: KernelConfig,
    centroid_config: KernelConfig,
    k: usize,
    max_iterations: u32,
    buffer_size: usize,
    adapters: Option<Adapters<P, L, M>>,
}

impl<P: ClPoint, L: ClLabel, M: ClMass> ThreeStagePipeline<P, L, M> {
    /// Builds the pipeline from a parsed configuration.
    pub fn from_config(config: &Config, k: usize) -> Result<ThreeStagePipeline<P, L, M>> {
        if config.kmeans.pipeline != PipelineKind::ThreeStage {
            return Err(Error::ConfigParse(
                "configuration does not select the three_stage pipeline".into(),
            ));
        }
        let (platform_idx, device_idx) = config.stage_device();
        let handle = open_device(platform_idx, device_idx)?;
        ThreeStagePipeline::new(
            handle,
            config.labeling.clone().expect("validated config"),
            config.mass_update.clone().expect("validated config"),
            config.centroid_update.clone().expect("validated config"),
            k,
            config.kmeans.iterations,
            DEFAULT_BUFFER_SIZE,
        )
    }

    pub fn new(
        handle: DeviceHandle,
        labeling_config: KernelConfig,
        mass_config: KernelConfig,
        centroid_config: KernelConfig,
        k: usize,
        max_iterations: u32,
        buffer_size: usize,
    ) -> Result<ThreeStagePipeline<P, L, M>> {
        if k == 0 {
            return Err(Error::InvalidArgument("k must be non-zero".into()));
        }
        Ok(ThreeStagePipeline {
            handle,
            labeling_config,
            mass_config,
            centroid_config,
            k,
            max_iterations,
            buffer_size,
            adapters: None,
        })
    }

    pub fn set_max_iterations(&mut self, max_iterations: u32) {
        self.max_iterations = max_iterations;
    }

    fn adapters(&mut self, num_features: usize) -> Result<()> {
        if self.adapters.is_none() {
            let context = &self.handle.context;
            let device = self.handle.device;
            self.adapters = Some(Adapters {
                labeling: Rc::new(Labeling::prepare(context, device, &self.labeling_config)?),
                mass: Rc::new(MassUpdate::prepare(context, device, &self.mass_config, self.k)?),
                centroid: Rc::new(CentroidUpdate::prepare(
                    context,
                    device,
                    &self.centroid_config,
                    num_features,
                    self.k,
                )?),
                divide: RowDivide::prepare(context, device, &self.centroid_config)?,
            });
        }
        Ok(())
    }
}

impl<P: ClPoint, L: ClLabel, M: ClMass> KmeansPipeline<P, L, M> for ThreeStagePipeline<P, L, M> {
    fn run(
        &mut self,
        points: &Matrix<P>,
        measurement: &mut Measurement,
    ) -> Result<RunOutput<P, L, M>> {
        let num_points = points.rows();
        let num_features = points.cols();
        let k = self.k;
        if k > num_points {
            return Err(Error::InvalidArgument(format!(
                "k = {} exceeds the number of points {}",
                k, num_points
            )));
        }

        let geometry = chunk_geometry::<P, L>(self.buffer_size, num_points, num_features)?;
        let max_iterations = self.max_iterations;
        let buffer_size = self.buffer_size;
        self.adapters(num_features)?;
        let adapters = self.adapters.as_ref().unwrap();
        let handle = &self.handle;
        let queue = &handle.queue;

        // Host staging: chunk-local column-major point tiles, zeroed labels.
        let tiles = partition_tiles(points, geometry.points_per_chunk);
        let mut host_labels = vec![L::from_usize(0); num_points];

        // A fresh streaming engine per run; its object registry borrows the
        // staging vectors above for exactly this run.
        let cache = Rc::new(RefCell::new(BufferCache::new(buffer_size)));
        cache.borrow_mut().add_device(
            &handle.context,
            handle.device,
            pool_budget(handle.device, buffer_size),
        )?;
        let mut scheduler = Scheduler::new();
        scheduler.attach_cache(cache.clone());
        scheduler.add_device(&handle.context, handle.device)?;

        let points_oid = unsafe {
            cache.borrow_mut().add_object(
                tiles.as_ptr() as *mut u8,
                tiles.len() * mem::size_of::<P>(),
                ObjectMode::Immutable,
                geometry.point_chunk_bytes,
            )?
        };
        let labels_oid = unsafe {
            cache.borrow_mut().add_object(
                host_labels.as_mut_ptr() as *mut u8,
                host_labels.len() * mem::size_of::<L>(),
                ObjectMode::Mutable,
                geometry.label_chunk_bytes,
            )?
        };

        // Device-resident controller state.
        let initial = first_k_centroids(points, k);
        let mut old_centroids = Buffer::<P>::builder()
            .queue(queue.clone())
            .len(k * num_features)
            .copy_host_slice(&initial)
            .build()?;
        let mut new_centroids = Buffer::<P>::builder()
            .queue(queue.clone())
            .len(k * num_features)
            .fill_val(P::default())
            .build()?;
        let masses = Buffer::<M>::builder()
            .queue(queue.clone())
            .len(k)
            .fill_val(M::default())
            .build()?;
        let did_changes = Buffer::<u8>::builder()
            .queue(queue.clone())
            .len(1)
            .fill_val(0u8)
            .build()?;
        queue.finish()?;

        let total_timer = Instant::now();
        let mut iterations = 0;

        while iterations < max_iterations {
            fill_zero(queue, &masses)?;
            fill_zero(queue, &new_centroids)?;
            fill_zero(queue, &did_changes)?;
            queue.finish()?;

            let sink: Rc<RefCell<Vec<DataPoint>>> = Rc::new(RefCell::new(Vec::new()));
            let labels_base = host_labels.as_mut_ptr() as *mut u8;

            let labeling_work: Box<BinaryFn> = {
                let labeling = adapters.labeling.clone();
                let old_centroids = old_centroids.clone();
                let did_changes = did_changes.clone();
                let sink = sink.clone();
                let iteration = iterations;
                Box::new(
                    move |queue, _p_off, l_off, _p_len, l_len, p_buf, l_buf, wait| {
                        let chunk_points = l_len / mem::size_of::<L>();
                        let mut dp = DataPoint::with_iteration("Labeling", iteration);
                        let event = labeling.invoke(
                            queue,
                            num_features,
                            chunk_points,
                            k,
                            &did_changes,
                            p_buf,
                            &old_centroids,
                            l_buf,
                            &mut dp,
                            wait,
                        )?;

                        // Drain the freshly written labels chunk to the host
                        // array so re-staged chunks and the final output see
                        // current labels.
                        let read_event = {
                            let mut read_event = Event::empty();
                            let dst =
                                unsafe { slice::from_raw_parts_mut(labels_base.add(l_off), l_len) };
                            unsafe {
                                l_buf
                                    .cmd()
                                    .queue(queue)
                                    .read(dst)
                                    .block(false)
                                    .ewait(&event)
                                    .enew(&mut read_event)
                                    .enq()?;
                            }
                            read_event
                        };
                        dp.create_child("LabelsD2H").add_event(read_event.clone());
                        sink.borrow_mut().push(dp);
                        Ok(read_event)
                    },
                )
            };
            let labeling_future = scheduler.enqueue_binary(
                labeling_work,
                points_oid,
                labels_oid,
                geometry.point_chunk_bytes,
                geometry.label_chunk_bytes,
            )?;

            let mass_work: Box<UnaryFn> = {
                let mass = adapters.mass.clone();
                let masses = masses.clone();
                let sink = sink.clone();
                let iteration = iterations;
                Box::new(move |queue, _off, len, l_buf, wait| {
                    let chunk_points = len / mem::size_of::<L>();
                    let mut dp = DataPoint::with_iteration("MassUpdate", iteration);
                    let event = mass.invoke(queue, chunk_points, k, l_buf, &masses, &mut dp, wait)?;
                    sink.borrow_mut().push(dp);
                    Ok(event)
                })
            };
            let mass_future =
                scheduler.enqueue_unary(mass_work, labels_oid, geometry.label_chunk_bytes)?;

            let centroid_work: Box<BinaryFn> = {
                let centroid = adapters.centroid.clone();
                let new_centroids = new_centroids.clone();
                let sink = sink.clone();
                let iteration = iterations;
                Box::new(
                    move |queue, _p_off, _l_off, _p_len, l_len, p_buf, l_buf, wait| {
                        let chunk_points = l_len / mem::size_of::<L>();
                        let mut dp = DataPoint::with_iteration("CentroidUpdate", iteration);
                        let event = centroid.invoke(
                            queue,
                            num_features,
                            chunk_points,
                            k,
                            p_buf,
                            l_buf,
                            &new_centroids,
                            &mut dp,
                            wait,
                        )?;
                        sink.borrow_mut().push(dp);
                        Ok(event)
                    },
                )
            };
            let centroid_future = scheduler.enqueue_binary(
                centroid_work,
                points_oid,
                labels_oid,
                geometry.point_chunk_bytes,
                geometry.label_chunk_bytes,
            )?;

            scheduler.run()?;
            let labeling_events = labeling_future.wait()?;
            let mass_events = mass_future.wait()?;
            let centroid_events = centroid_future.wait()?;
            debug!(
                "iteration {}: {} labeling, {} mass, {} centroid launches",
                iterations,
                labeling_events.len(),
                mass_events.len(),
                centroid_events.len()
            );

            // All chunk sums are in; normalize. Empty clusters keep their
            // previous centroid.
            let mut divide_dp = DataPoint::with_iteration("CentroidDivide", iterations);
            adapters.divide.divide_or_keep(
                queue,
                k,
                num_features,
                &new_centroids,
                &masses,
                &old_centroids,
                &mut divide_dp,
                &EventList::new(),
            )?;
            sink.borrow_mut().push(divide_dp);

            let mut flag = [0u8; 1];
            did_changes.cmd().queue(queue).read(&mut flag[..]).enq()?;

            iterations += 1;
            for dp in sink.borrow_mut().drain(..) {
                measurement.push(dp);
            }

            // The centroids computed this iteration become current before
            // the convergence check.
            mem::swap(&mut old_centroids, &mut new_centroids);

            if flag[0] == 0 {
                debug!("labels stable after {} iterations", iterations);
                break;
            }
        }

        queue.finish()?;
        let mut total = DataPoint::new("TotalTime");
        total.add_value(total_timer.elapsed().as_nanos() as u64);
        measurement.push(total);

        let mut centroids = vec![P::default(); k * num_features];
        old_centroids.cmd().queue(queue).read(&mut centroids[..]).enq()?;
        let mut host_masses = vec![M::from_usize(0); k];
        masses.cmd().queue(queue).read(&mut host_masses[..]).enq()?;

        Ok(RunOutput {
            centroids,
            labels: host_labels,
            masses: host_masses,
            iterations,
        })
    }
}
