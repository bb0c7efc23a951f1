//! Scheduler ordering and chunking against a real device.

use std::cell::RefCell;
use std::rc::Rc;

use ocl::{Event, EventList};

use crate::cache::{BufferCache, ObjectMode};
use crate::scheduler::{BinaryFn, Scheduler, UnaryFn};
use crate::tests::require_device;

fn engine(td: &crate::tests::TestDevice, buffer_size: usize) -> (Rc<RefCell<BufferCache>>, Scheduler) {
    let cache = Rc::new(RefCell::new(BufferCache::new(buffer_size)));
    cache
        .borrow_mut()
        .add_device(&td.context, td.device, 1 << 24)
        .unwrap();
    let mut scheduler = Scheduler::new();
    scheduler.attach_cache(cache.clone());
    scheduler.add_device(&td.context, td.device).unwrap();
    (cache, scheduler)
}

fn marker(queue: &ocl::Queue, wait: &EventList) -> crate::error::Result<Event> {
    if wait.as_slice().is_empty() {
        Ok(queue.enqueue_marker(None::<&EventList>)?)
    } else {
        Ok(queue.enqueue_marker(Some(wait))?)
    }
}

#[test]
fn unary_work_chunks_with_tail() {
    let td = require_device!();
    let (cache, mut scheduler) = engine(&td, 64);

    // 192 bytes of u32s at 64-byte chunks: exactly three chunks of 16
    // values, slots used in order 0, 1, 0.
    let mut data: Vec<u32> = (0..48u32).collect();
    let oid = unsafe {
        cache
            .borrow_mut()
            .add_object(data.as_mut_ptr() as *mut u8, 192, ObjectMode::Immutable, 64)
            .unwrap()
    };

    let seen: Rc<RefCell<Vec<(usize, usize)>>> = Rc::new(RefCell::new(Vec::new()));
    let buffers: Rc<RefCell<Vec<*mut std::ffi::c_void>>> = Rc::new(RefCell::new(Vec::new()));
    let work: Box<UnaryFn> = {
        let seen = seen.clone();
        let buffers = buffers.clone();
        Box::new(move |queue, offset, len, buffer, wait| {
            seen.borrow_mut().push((offset, len));
            buffers.borrow_mut().push(buffer.as_core().as_ptr());
            marker(queue, wait)
        })
    };

    let future = scheduler.enqueue_unary(work, oid, 64).unwrap();
    scheduler.run().unwrap();

    let events = future.wait().unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(*seen.borrow(), vec![(0, 64), (64, 64), (128, 64)]);
    let buffers = buffers.borrow();
    assert_eq!(buffers[0], buffers[2], "chunks 0 and 2 share a slot");
    assert_ne!(buffers[0], buffers[1]);
}

#[test]
fn tail_chunk_carries_the_remainder() {
    let td = require_device!();
    let (cache, mut scheduler) = engine(&td, 64);

    let mut data = vec![0u8; 129];
    let oid = unsafe {
        cache
            .borrow_mut()
            .add_object(data.as_mut_ptr(), 129, ObjectMode::Immutable, 64)
            .unwrap()
    };

    let seen: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
    let work: Box<UnaryFn> = {
        let seen = seen.clone();
        Box::new(move |queue, _offset, len, _buffer, wait| {
            seen.borrow_mut().push(len);
            marker(queue, wait)
        })
    };

    scheduler.enqueue_unary(work, oid, 64).unwrap();
    scheduler.run().unwrap();
    assert_eq!(*seen.borrow(), vec![64, 64, 1]);
}

#[test]
fn overlapping_work_items_chain_events() {
    let td = require_device!();
    let (cache, mut scheduler) = engine(&td, 256);

    let mut data = vec![0u8; 256];
    let oid = unsafe {
        cache
            .borrow_mut()
            .add_object(data.as_mut_ptr(), 256, ObjectMode::Mutable, 256)
            .unwrap()
    };

    let first_event: Rc<RefCell<Option<Event>>> = Rc::new(RefCell::new(None));

    let first: Box<UnaryFn> = {
        let first_event = first_event.clone();
        Box::new(move |queue, _offset, _len, _buffer, wait| {
            let event = marker(queue, wait)?;
            *first_event.borrow_mut() = Some(event.clone());
            Ok(event)
        })
    };

    let chained: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));
    let second: Box<UnaryFn> = {
        let first_event = first_event.clone();
        let chained = chained.clone();
        Box::new(move |queue, _offset, _len, _buffer, wait| {
            let expected = first_event.borrow();
            let expected = expected.as_ref().expect("first work item ran");
            let found = wait
                .as_slice()
                .iter()
                .any(|ev| ev.as_core() == expected.as_core());
            *chained.borrow_mut() = found;
            marker(queue, wait)
        })
    };

    scheduler.enqueue_unary(first, oid, 256).unwrap();
    scheduler.enqueue_unary(second, oid, 256).unwrap();
    scheduler.run().unwrap();

    assert!(
        *chained.borrow(),
        "the second work item must wait on the first's event"
    );
}

#[test]
fn barrier_separates_work_groups() {
    let td = require_device!();
    let (cache, mut scheduler) = engine(&td, 256);

    let mut fst = vec![0u8; 256];
    let mut snd = vec![0u8; 256];
    let a = unsafe {
        cache
            .borrow_mut()
            .add_object(fst.as_mut_ptr(), 256, ObjectMode::Immutable, 256)
            .unwrap()
    };
    let b = unsafe {
        cache
            .borrow_mut()
            .add_object(snd.as_mut_ptr(), 256, ObjectMode::Immutable, 256)
            .unwrap()
    };

    let first: Box<UnaryFn> = Box::new(move |queue, _o, _l, _b, wait| marker(queue, wait));

    // Object `b` is untouched by the first group, so without the barrier
    // its only wait entry would be its own staging write.
    let wait_len: Rc<RefCell<usize>> = Rc::new(RefCell::new(0));
    let second: Box<UnaryFn> = {
        let wait_len = wait_len.clone();
        Box::new(move |queue, _o, _l, _b, wait| {
            *wait_len.borrow_mut() = wait.as_slice().len();
            marker(queue, wait)
        })
    };

    scheduler.enqueue_unary(first, a, 256).unwrap();
    scheduler.enqueue_barrier();
    scheduler.enqueue_unary(second, b, 256).unwrap();
    scheduler.run().unwrap();

    assert_eq!(
        *wait_len.borrow(),
        2,
        "staging write plus the barrier marker"
    );
}

#[test]
fn binary_work_pairs_chunks() {
    let td = require_device!();
    let (cache, mut scheduler) = engine(&td, 64);

    // 48 u32 "points" (one feature) paired with 48 u8 "labels": three
    // chunk pairs of 16 elements each.
    let mut points: Vec<u32> = (0..48u32).collect();
    let mut labels = vec![0u8; 48];
    let points_oid = unsafe {
        cache
            .borrow_mut()
            .add_object(points.as_mut_ptr() as *mut u8, 192, ObjectMode::Immutable, 64)
            .unwrap()
    };
    let labels_oid = unsafe {
        cache
            .borrow_mut()
            .add_object(labels.as_mut_ptr(), 48, ObjectMode::Mutable, 16)
            .unwrap()
    };

    let seen: Rc<RefCell<Vec<(usize, usize, usize, usize)>>> = Rc::new(RefCell::new(Vec::new()));
    let work: Box<BinaryFn> = {
        let seen = seen.clone();
        Box::new(move |queue, f_off, s_off, f_len, s_len, _f, _s, wait| {
            seen.borrow_mut().push((f_off, s_off, f_len, s_len));
            marker(queue, wait)
        })
    };

    let future = scheduler
        .enqueue_binary(work, points_oid, labels_oid, 64, 16)
        .unwrap();
    scheduler.run().unwrap();

    assert_eq!(future.wait().unwrap().len(), 3);
    assert_eq!(
        *seen.borrow(),
        vec![(0, 0, 64, 16), (64, 16, 64, 16), (128, 32, 64, 16)]
    );
}

#[test]
fn mismatched_chunk_counts_are_rejected() {
    let td = require_device!();
    let (cache, mut scheduler) = engine(&td, 64);

    let mut fst = vec![0u8; 128];
    let mut snd = vec![0u8; 48];
    let a = unsafe {
        cache
            .borrow_mut()
            .add_object(fst.as_mut_ptr(), 128, ObjectMode::Immutable, 64)
            .unwrap()
    };
    let b = unsafe {
        cache
            .borrow_mut()
            .add_object(snd.as_mut_ptr(), 48, ObjectMode::Mutable, 48)
            .unwrap()
    };

    let work: Box<BinaryFn> = Box::new(move |queue, _fo, _so, _fl, _sl, _f, _s, wait| {
        marker(queue, wait)
    });
    assert!(scheduler.enqueue_binary(work, a, b, 64, 48).is_err());
}
