//! A single-device work scheduler over the buffer cache.
//!
//! Work is submitted as closures over one or two objects. The scheduler
//! splits each object into chunks, makes every chunk resident through the
//! cache, invokes the closure with a wait list carrying the chunk's
//! upstream events, and releases each slot once the event that consumed it
//! has completed. Two command queues per device let transfers of chunk
//! `i + 1` overlap compute on chunk `i`.
//!
//! Ordering: work items against the same `(object, buffer id)` observe
//! in-order enqueue through a direct event dependency; disjoint tenancies
//! may interleave. [`Scheduler::enqueue_barrier`] strictly separates the
//! work items before it from the ones after it.
//!
//! Everything runs on the calling thread; the only blocking points are the
//! implicit slot-unlock waits and the final drain at the end of
//! [`Scheduler::run`].

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use futures::sync::oneshot;
use futures::{Async, Future, Poll};
use log::debug;
use ocl::flags::CommandQueueProperties;
use ocl::{Buffer, Context, Device, Event, EventList, Queue};

use crate::cache::{BufferCache, ObjectId, NUM_SLOTS};
use crate::error::{Error, Result};

/// Work over one chunk of a single object:
/// `(queue, byte_offset, byte_len, device_buffer, wait_list) -> event`.
pub type UnaryFn =
    dyn FnMut(&Queue, usize, usize, &Buffer<u8>, &EventList) -> Result<Event>;

/// Work over paired chunks of two objects:
/// `(queue, fst_offset, snd_offset, fst_len, snd_len, fst_buffer,
/// snd_buffer, wait_list) -> event`.
pub type BinaryFn = dyn FnMut(
    &Queue,
    usize,
    usize,
    usize,
    usize,
    &Buffer<u8>,
    &Buffer<u8>,
    &EventList,
) -> Result<Event>;

enum Task {
    Unary {
        work: Box<UnaryFn>,
        oid: ObjectId,
        chunk_size: usize,
        promise: oneshot::Sender<VecDeque<Event>>,
    },
    Binary {
        work: Box<BinaryFn>,
        fst: ObjectId,
        snd: ObjectId,
        fst_chunk: usize,
        snd_chunk: usize,
        promise: oneshot::Sender<VecDeque<Event>>,
    },
    Barrier,
}

/// Resolves to the events of every kernel invocation produced by one
/// `enqueue_*` call, in chunk order. Resolved by [`Scheduler::run`].
pub struct EventsFuture {
    rx: oneshot::Receiver<VecDeque<Event>>,
}

impl EventsFuture {
    /// Returns the work item's events. Call after [`Scheduler::run`].
    pub fn wait(self) -> Result<VecDeque<Event>> {
        self.rx.wait().map_err(|_| {
            Error::DeviceFailure(ocl::Error::from(
                "scheduler dropped the work item before it completed",
            ))
        })
    }
}

impl Future for EventsFuture {
    type Item = VecDeque<Event>;
    type Error = Error;

    fn poll(&mut self) -> Poll<VecDeque<Event>, Error> {
        match self.rx.poll() {
            Ok(Async::Ready(events)) => Ok(Async::Ready(events)),
            Ok(Async::NotReady) => Ok(Async::NotReady),
            Err(_) => Err(Error::DeviceFailure(ocl::Error::from(
                "scheduler dropped the work item before it completed",
            ))),
        }
    }
}

struct DeviceQueues {
    device: Device,
    qpair: [Queue; 2],
}

/// See the module documentation.
pub struct Scheduler {
    cache: Option<Rc<RefCell<BufferCache>>>,
    device: Option<DeviceQueues>,
    pending: VecDeque<Task>,
    // Last event issued against each (object, buffer id) tenancy.
    last_events: HashMap<(ObjectId, usize), Event>,
    // In-flight slot consumers: (object, slot index) -> (event, chunk begin).
    inflight: HashMap<(ObjectId, usize), (Event, usize)>,
    // Everything issued since the last barrier.
    issued: Vec<Event>,
    barrier: Option<Event>,
}

impl Default for Scheduler {
    fn default() -> Scheduler {
        Scheduler::new()
    }
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            cache: None,
            device: None,
            pending: VecDeque::new(),
            last_events: HashMap::new(),
            inflight: HashMap::new(),
            issued: Vec::new(),
            barrier: None,
        }
    }

    /// Attaches the buffer cache. One cache per scheduler.
    pub fn attach_cache(&mut self, cache: Rc<RefCell<BufferCache>>) {
        self.cache = Some(cache);
    }

    /// Registers the device and creates its queue pair. The cache must be
    /// attached and must already know the device.
    pub fn add_device(&mut self, context: &Context, device: Device) -> Result<()> {
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("no buffer cache attached".into()))?;
        if !cache.borrow().knows_device(device) {
            return Err(Error::InvalidArgument(
                "device is not registered with the buffer cache".into(),
            ));
        }
        if self.device.is_some() {
            return Err(Error::InvalidArgument(
                "single-device scheduler already has a device".into(),
            ));
        }

        let props = Some(CommandQueueProperties::new().profiling());
        let qpair = [
            Queue::new(context, device, props)?,
            Queue::new(context, device, props)?,
        ];
        self.device = Some(DeviceQueues { device, qpair });
        Ok(())
    }

    /// Enqueues `work` once per chunk of `oid`. `chunk_size` must equal the
    /// object's registered chunk stride.
    pub fn enqueue_unary(
        &mut self,
        work: Box<UnaryFn>,
        oid: ObjectId,
        chunk_size: usize,
    ) -> Result<EventsFuture> {
        self.check_chunk_size(oid, chunk_size)?;
        let (tx, rx) = oneshot::channel();
        self.pending.push_back(Task::Unary { work, oid, chunk_size, promise: tx });
        Ok(EventsFuture { rx })
    }

    /// Enqueues `work` once per chunk pair of `fst` and `snd` (for example
    /// a point chunk and the labels covering the same points). Both objects
    /// must split into the same number of chunks.
    pub fn enqueue_binary(
        &mut self,
        work: Box<BinaryFn>,
        fst: ObjectId,
        snd: ObjectId,
        fst_chunk: usize,
        snd_chunk: usize,
    ) -> Result<EventsFuture> {
        self.check_chunk_size(fst, fst_chunk)?;
        self.check_chunk_size(snd, snd_chunk)?;
        {
            let cache = self.attached_cache()?.borrow();
            let n_fst = cache.num_chunks(fst)?;
            let n_snd = cache.num_chunks(snd)?;
            if n_fst != n_snd {
                return Err(Error::InvalidArgument(format!(
                    "chunk counts differ: {} chunks of object {:?} vs {} of {:?}",
                    n_fst, fst, n_snd, snd
                )));
            }
        }
        let (tx, rx) = oneshot::channel();
        self.pending.push_back(Task::Binary {
            work,
            fst,
            snd,
            fst_chunk,
            snd_chunk,
            promise: tx,
        });
        Ok(EventsFuture { rx })
    }

    /// All work items enqueued after this call wait on every work item
    /// enqueued before it.
    pub fn enqueue_barrier(&mut self) {
        self.pending.push_back(Task::Barrier);
    }

    /// Drains the pending queue, running every work item to completion
    /// (all slots are unlocked and all issued events have fired when this
    /// returns).
    pub fn run(&mut self) -> Result<()> {
        while let Some(task) = self.pending.pop_front() {
            match task {
                Task::Barrier => self.run_barrier()?,
                Task::Unary { mut work, oid, chunk_size, promise } => {
                    let events = self.run_unary(&mut *work, oid, chunk_size)?;
                    let _ = promise.send(events);
                }
                Task::Binary { mut work, fst, snd, fst_chunk, snd_chunk, promise } => {
                    let events = self.run_binary(&mut *work, fst, snd, fst_chunk, snd_chunk)?;
                    let _ = promise.send(events);
                }
            }
        }
        self.drain()?;
        self.issued.clear();
        self.barrier = None;
        Ok(())
    }

    fn run_barrier(&mut self) -> Result<()> {
        if self.issued.is_empty() {
            self.barrier = None;
            return Ok(());
        }
        let marker = {
            let dev = self.device()?;
            let mut list = EventList::new();
            for ev in &self.issued {
                list.push(ev.clone());
            }
            dev.qpair[0].enqueue_marker(Some(&list))?
        };
        debug!("barrier over {} events", self.issued.len());
        self.issued.clear();
        self.barrier = Some(marker);
        Ok(())
    }

    fn run_unary(
        &mut self,
        work: &mut UnaryFn,
        oid: ObjectId,
        chunk_size: usize,
    ) -> Result<VecDeque<Event>> {
        let len = self.cache().borrow().object_len(oid)?;
        let chunks = chunk_ranges(len, chunk_size);
        let qpair = self.device()?.qpair.clone();

        let mut events = VecDeque::with_capacity(chunks.len());
        for (i, &(begin, end)) in chunks.iter().enumerate() {
            let queue = qpair[i % NUM_SLOTS].clone();
            let mut wait = EventList::new();
            if let Some(b) = &self.barrier {
                wait.push(b.clone());
            }

            let bid = i;
            let buffer = self.stage(&queue, oid, bid, begin, end, &mut wait)?;
            let event = work(&queue, begin, end - begin, &buffer, &wait)?;
            self.record(oid, bid, begin, &event);
            events.push_back(event);
        }
        Ok(events)
    }

    fn run_binary(
        &mut self,
        work: &mut BinaryFn,
        fst: ObjectId,
        snd: ObjectId,
        fst_chunk: usize,
        snd_chunk: usize,
    ) -> Result<VecDeque<Event>> {
        let (fst_len, snd_len) = {
            let cache = self.cache().borrow();
            (cache.object_len(fst)?, cache.object_len(snd)?)
        };
        let fst_chunks = chunk_ranges(fst_len, fst_chunk);
        let snd_chunks = chunk_ranges(snd_len, snd_chunk);
        debug_assert_eq!(fst_chunks.len(), snd_chunks.len());
        let qpair = self.device()?.qpair.clone();

        let mut events = VecDeque::with_capacity(fst_chunks.len());
        for (i, (&(f_begin, f_end), &(s_begin, s_end))) in
            fst_chunks.iter().zip(snd_chunks.iter()).enumerate()
        {
            let queue = qpair[i % NUM_SLOTS].clone();
            let mut wait = EventList::new();
            if let Some(b) = &self.barrier {
                wait.push(b.clone());
            }

            let bid = i;
            let fst_buf = self.stage(&queue, fst, bid, f_begin, f_end, &mut wait)?;
            let snd_buf = self.stage(&queue, snd, bid, s_begin, s_end, &mut wait)?;
            let event = work(
                &queue,
                f_begin,
                s_begin,
                f_end - f_begin,
                s_end - s_begin,
                &fst_buf,
                &snd_buf,
                &wait,
            )?;
            self.record(fst, bid, f_begin, &event);
            self.record(snd, bid, s_begin, &event);
            events.push_back(event);
        }
        Ok(events)
    }

    /// Makes one chunk resident: drains the previous consumer of the slot
    /// it maps to, `get`s the range and extends `wait` with the chunk's
    /// upstream events (staging write plus the last event recorded against
    /// the tenancy).
    fn stage(
        &mut self,
        queue: &Queue,
        oid: ObjectId,
        bid: usize,
        begin: usize,
        end: usize,
        wait: &mut EventList,
    ) -> Result<Buffer<u8>> {
        let device = self.device()?.device;
        let slot_key = (oid, bid % NUM_SLOTS);
        if let Some((event, old_begin)) = self.inflight.remove(&slot_key) {
            event.wait_for()?;
            self.cache().borrow_mut().unlock(device, oid, old_begin)?;
        }

        let upstream: Vec<Event> =
            self.last_events.get(&(oid, bid)).cloned().into_iter().collect();
        let entry = self
            .cache()
            .borrow_mut()
            .get(queue, oid, begin, end, &upstream)?;

        if let Some(ev) = entry.event {
            wait.push(ev);
        }
        for ev in upstream {
            wait.push(ev);
        }
        Ok(entry.buffer)
    }

    fn record(&mut self, oid: ObjectId, bid: usize, begin: usize, event: &Event) {
        self.last_events.insert((oid, bid), event.clone());
        self.inflight.insert((oid, bid % NUM_SLOTS), (event.clone(), begin));
        self.issued.push(event.clone());
    }

    /// Waits out and unlocks every in-flight slot.
    fn drain(&mut self) -> Result<()> {
        if self.inflight.is_empty() {
            return Ok(());
        }
        let device = self.device()?.device;
        let cache = self.cache().clone();
        for ((oid, _slot), (event, begin)) in self.inflight.drain() {
            event.wait_for()?;
            cache.borrow_mut().unlock(device, oid, begin)?;
        }
        Ok(())
    }

    fn check_chunk_size(&self, oid: ObjectId, chunk_size: usize) -> Result<()> {
        let stride = self.attached_cache()?.borrow().chunk_stride(oid)?;
        if chunk_size != stride {
            return Err(Error::InvalidArgument(format!(
                "chunk size {} does not match the registered stride {} of {:?}",
                chunk_size, stride, oid
            )));
        }
        Ok(())
    }

    fn attached_cache(&self) -> Result<&Rc<RefCell<BufferCache>>> {
        self.cache
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("no buffer cache attached".into()))
    }

    // Run-time accessor; `run` paths are only reachable once `add_device`
    // has validated the cache attachment.
    fn cache(&self) -> &Rc<RefCell<BufferCache>> {
        self.cache.as_ref().expect("scheduler: no cache attached")
    }

    fn device(&self) -> Result<&DeviceQueues> {
        self.device
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("scheduler has no device".into()))
    }
}

/// Splits `len` bytes into `chunk`-sized ranges; the final range carries
/// the remainder.
pub(crate) fn chunk_ranges(len: usize, chunk: usize) -> Vec<(usize, usize)> {
    let mut ranges = Vec::with_capacity((len + chunk - 1) / chunk);
    let mut begin = 0;
    while begin < len {
        let end = (begin + chunk).min(len);
        ranges.push((begin, end));
        begin = end;
    }
    ranges
}
