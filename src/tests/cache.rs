//! Buffer-cache invariants against a real device.

use std::cell::RefCell;
use std::rc::Rc;

use crate::cache::{BufferCache, ObjectMode};
use crate::error::Error;
use crate::tests::require_device;

const BUFFER_SIZE: usize = 4096;

#[test]
fn pool_budget_must_exceed_a_slot_pair() {
    let td = require_device!();
    let mut cache = BufferCache::new(BUFFER_SIZE);
    match cache.add_device(&td.context, td.device, 2 * BUFFER_SIZE) {
        Err(Error::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other.map(|_| ())),
    }
    assert!(cache
        .add_device(&td.context, td.device, 2 * BUFFER_SIZE + 1)
        .is_ok());
}

#[test]
fn staged_slot_holds_the_host_bytes() {
    let td = require_device!();
    let mut cache = BufferCache::new(BUFFER_SIZE);
    cache
        .add_device(&td.context, td.device, 64 * BUFFER_SIZE)
        .unwrap();

    let mut data: Vec<u32> = (0..256u32).collect();
    let len = data.len() * 4;
    let oid = unsafe {
        cache
            .add_object(data.as_mut_ptr() as *mut u8, len, ObjectMode::Immutable, BUFFER_SIZE)
            .unwrap()
    };

    let entry = cache.get(&td.queue, oid, 0, len, &[]).unwrap();
    assert_eq!(entry.len, len);
    entry.event.as_ref().unwrap().wait_for().unwrap();

    let mut readback = vec![0u8; len];
    entry
        .buffer
        .cmd()
        .queue(&td.queue)
        .read(&mut readback[..])
        .enq()
        .unwrap();
    let expected: Vec<u8> = data.iter().flat_map(|v| v.to_ne_bytes()).collect();
    assert_eq!(readback, expected);

    cache.unlock(td.device, oid, 0).unwrap();
}

#[test]
fn second_get_of_a_resident_chunk_issues_no_transfer() {
    let td = require_device!();
    let mut cache = BufferCache::new(BUFFER_SIZE);
    cache
        .add_device(&td.context, td.device, 64 * BUFFER_SIZE)
        .unwrap();

    let mut data = vec![7u8; 512];
    let oid = unsafe {
        cache
            .add_object(data.as_mut_ptr(), data.len(), ObjectMode::Immutable, BUFFER_SIZE)
            .unwrap()
    };

    let first = cache.get(&td.queue, oid, 0, 512, &[]).unwrap();
    assert!(first.event.is_some());
    first.event.as_ref().unwrap().wait_for().unwrap();
    cache.unlock(td.device, oid, 0).unwrap();

    let second = cache.get(&td.queue, oid, 0, 512, &[]).unwrap();
    assert!(second.event.is_none(), "resident chunk must not re-transfer");
    cache.unlock(td.device, oid, 0).unwrap();
}

#[test]
fn locked_slot_with_a_different_tenant_is_a_hard_error() {
    let td = require_device!();
    let mut cache = BufferCache::new(64);
    cache.add_device(&td.context, td.device, 1 << 20).unwrap();

    // Three chunks: chunk 0 and chunk 2 share slot 0.
    let mut data = vec![1u8; 192];
    let oid = unsafe {
        cache
            .add_object(data.as_mut_ptr(), data.len(), ObjectMode::Immutable, 64)
            .unwrap()
    };

    let c0 = cache.get(&td.queue, oid, 0, 64, &[]).unwrap();
    let _c1 = cache.get(&td.queue, oid, 64, 128, &[]).unwrap();

    match cache.get(&td.queue, oid, 128, 192, &[]) {
        Err(Error::ResourceExhausted(_)) => {}
        other => panic!("expected ResourceExhausted, got {:?}", other.map(|_| ())),
    }

    // Releasing chunk 0 frees the slot for chunk 2.
    c0.event.as_ref().unwrap().wait_for().unwrap();
    cache.unlock(td.device, oid, 0).unwrap();
    let c2 = cache.get(&td.queue, oid, 128, 192, &[]).unwrap();
    assert!(c2.event.is_some());
}

#[test]
fn alternating_chunks_reuse_alternating_slots() {
    let td = require_device!();
    let mut cache = BufferCache::new(64);
    cache.add_device(&td.context, td.device, 1 << 20).unwrap();

    let mut data = vec![0u8; 192];
    let oid = unsafe {
        cache
            .add_object(data.as_mut_ptr(), data.len(), ObjectMode::Immutable, 64)
            .unwrap()
    };

    let mut slots = Vec::new();
    for (begin, end) in [(0, 64), (64, 128), (128, 192)] {
        let entry = cache.get(&td.queue, oid, begin, end, &[]).unwrap();
        entry.event.as_ref().unwrap().wait_for().unwrap();
        slots.push(entry.buffer.as_core().as_ptr());
        cache.unlock(td.device, oid, begin).unwrap();
    }
    assert_eq!(slots[0], slots[2], "chunks 0 and 2 share slot 0");
    assert_ne!(slots[0], slots[1], "chunk 1 takes the other slot");
}

#[test]
fn mutable_object_read_returns_device_bytes() {
    let td = require_device!();
    let mut cache = BufferCache::new(BUFFER_SIZE);
    cache
        .add_device(&td.context, td.device, 64 * BUFFER_SIZE)
        .unwrap();

    let mut data = vec![5u8; 256];
    let oid = unsafe {
        cache
            .add_object(data.as_mut_ptr(), data.len(), ObjectMode::Mutable, BUFFER_SIZE)
            .unwrap()
    };

    let entry = cache.get(&td.queue, oid, 0, 256, &[]).unwrap();
    entry.event.as_ref().unwrap().wait_for().unwrap();

    // Overwrite the device slot, then drain it back.
    entry
        .buffer
        .cmd()
        .queue(&td.queue)
        .fill(9u8, Some(256))
        .enq()
        .unwrap();
    td.queue.finish().unwrap();
    cache.unlock(td.device, oid, 0).unwrap();

    cache.read(&td.queue, oid, 0, 256).unwrap();
    assert!(data.iter().all(|&b| b == 9));
}

#[test]
fn read_of_an_evicted_chunk_is_rejected() {
    let td = require_device!();
    let mut cache = BufferCache::new(BUFFER_SIZE);
    cache
        .add_device(&td.context, td.device, 64 * BUFFER_SIZE)
        .unwrap();

    let mut data = vec![3u8; 128];
    let oid = unsafe {
        cache
            .add_object(data.as_mut_ptr(), data.len(), ObjectMode::Mutable, BUFFER_SIZE)
            .unwrap()
    };

    match cache.read(&td.queue, oid, 0, 128) {
        Err(Error::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn immutable_bytes_survive_a_stage_and_drain() {
    let td = require_device!();
    let cache = Rc::new(RefCell::new(BufferCache::new(BUFFER_SIZE)));
    cache
        .borrow_mut()
        .add_device(&td.context, td.device, 64 * BUFFER_SIZE)
        .unwrap();

    let mut data: Vec<u8> = (0..=255u8).collect();
    let snapshot = data.clone();
    let oid = unsafe {
        cache
            .borrow_mut()
            .add_object(data.as_mut_ptr(), data.len(), ObjectMode::Immutable, BUFFER_SIZE)
            .unwrap()
    };

    let entry = cache.borrow_mut().get(&td.queue, oid, 0, 256, &[]).unwrap();
    entry.event.as_ref().unwrap().wait_for().unwrap();
    cache.borrow_mut().unlock(td.device, oid, 0).unwrap();

    cache.borrow_mut().read(&td.queue, oid, 0, 256).unwrap();
    assert_eq!(data, snapshot, "read-only invariance");
}
