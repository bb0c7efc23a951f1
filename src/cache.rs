//! A fixed-capacity cache of device-resident buffer slots.
//!
//! Host memory ranges are registered as *objects* and addressed by dense
//! non-zero ids. Each object gets a pair of slots per registered device
//! (double buffering); a slot owns a device buffer of `buffer_size` bytes
//! and a pinned, persistently mapped host staging buffer. [`BufferCache::get`]
//! makes one chunk of an object resident and locks its slot;
//! [`BufferCache::read`] drains a resident chunk back to host memory;
//! [`BufferCache::unlock`] releases a slot once the consuming event has
//! completed.
//!
//! Slot assignment is deterministic: chunk `bid` of an object lands in slot
//! `bid % 2` of that object's pair, so successive chunks alternate slots and
//! a transfer for chunk `i + 1` can overlap compute on chunk `i`. There is
//! no eviction policy beyond that; a locked slot wanted by a different
//! tenancy is a hard error.

use std::ptr;
use std::slice;

use log::debug;
use ocl::flags::{MapFlags, MemFlags};
use ocl::{Buffer, Context, Device, Event, MemMap, Queue};

use crate::error::{Error, Result};

/// Default slot size: 16 MiB.
pub const DEFAULT_BUFFER_SIZE: usize = 16 << 20;

/// Double-buffering factor: slots per object per device.
pub const NUM_SLOTS: usize = 2;

/// Identifies a registered host-memory object. Id 0 is reserved invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(u32);

impl ObjectId {
    /// The reserved invalid id.
    pub const NULL: ObjectId = ObjectId(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Whether an object may be written back from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectMode {
    /// Source-only; staged to the device, never read back.
    Immutable,
    /// May be drained back to its host range via [`BufferCache::read`].
    Mutable,
}

/// A resident chunk handed out by [`BufferCache::get`].
///
/// `event`, when present, is the host→device write event the consumer must
/// wait on before touching `buffer`; `None` means the chunk was already
/// resident.
pub struct CacheEntry {
    pub buffer: Buffer<u8>,
    pub len: usize,
    pub event: Option<Event>,
}

struct ObjectEntry {
    ptr: *mut u8,
    len: usize,
    mode: ObjectMode,
    chunk_stride: usize,
}

struct Slot {
    device_buffer: Buffer<u8>,
    host_map: MemMap<u8>,
    // Keeps the pinned allocation alive for the lifetime of the mapping.
    _host_buffer: Buffer<u8>,
    locked: bool,
    tenant: Option<(ObjectId, usize)>,
}

struct DeviceEntry {
    device: Device,
    context: Context,
    map_queue: Queue,
    pool_size: usize,
    pool_used: usize,
    // Slot pairs indexed like `objects`; index 0 is the invalid sentinel.
    slots: Vec<Option<[Slot; NUM_SLOTS]>>,
}

/// See the module documentation.
pub struct BufferCache {
    buffer_size: usize,
    objects: Vec<ObjectEntry>,
    devices: Vec<DeviceEntry>,
}

impl BufferCache {
    pub fn new(buffer_size: usize) -> BufferCache {
        assert!(buffer_size > 0, "buffer_size must be non-zero");
        BufferCache {
            buffer_size,
            // Invalidate object id 0.
            objects: vec![ObjectEntry {
                ptr: ptr::null_mut(),
                len: 0,
                mode: ObjectMode::Immutable,
                chunk_stride: buffer_size,
            }],
            devices: Vec::new(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn knows_device(&self, device: Device) -> bool {
        self.find_device(device).is_some()
    }

    pub fn pool_size(&self, device: Device) -> Option<usize> {
        self.find_device(device).map(|did| self.devices[did].pool_size)
    }

    /// Registers a device and pre-allocates slot pairs for every object
    /// registered so far. `pool_size` bounds the device memory this cache
    /// may occupy on `device` and must exceed `2 * buffer_size`.
    pub fn add_device(&mut self, context: &Context, device: Device, pool_size: usize) -> Result<()> {
        if pool_size <= NUM_SLOTS * self.buffer_size {
            return Err(Error::InvalidArgument(format!(
                "pool size {} does not fit a slot pair of 2 x {} bytes",
                pool_size, self.buffer_size
            )));
        }
        if self.knows_device(device) {
            return Err(Error::InvalidArgument("device is already registered".into()));
        }

        let map_queue = Queue::new(context, device, None)?;
        let mut entry = DeviceEntry {
            device,
            context: context.clone(),
            map_queue,
            pool_size,
            pool_used: 0,
            slots: Vec::with_capacity(self.objects.len()),
        };

        entry.slots.push(None);
        for _ in 1..self.objects.len() {
            let pair = alloc_slot_pair(&mut entry, self.buffer_size)?;
            entry.slots.push(Some(pair));
        }

        self.devices.push(entry);
        Ok(())
    }

    /// Registers a host memory range of `len` bytes at `ptr` and returns its
    /// id. Slot pairs are allocated on every registered device, charged
    /// against the device pool budget.
    ///
    /// `chunk_stride` is the byte distance between successive chunk starts
    /// of this object (at most `buffer_size`); buffer ids derive from it.
    ///
    /// # Safety
    ///
    /// The range must stay valid, unmoved and unaliased by device transfers
    /// for the lifetime of the cache.
    pub unsafe fn add_object(
        &mut self,
        ptr: *mut u8,
        len: usize,
        mode: ObjectMode,
        chunk_stride: usize,
    ) -> Result<ObjectId> {
        if ptr.is_null() || len == 0 {
            return Err(Error::InvalidArgument("object range is empty".into()));
        }
        if chunk_stride == 0 || chunk_stride > self.buffer_size {
            return Err(Error::InvalidArgument(format!(
                "chunk stride {} outside (0, {}]",
                chunk_stride, self.buffer_size
            )));
        }

        for dev in &mut self.devices {
            let pair = alloc_slot_pair(dev, self.buffer_size)?;
            dev.slots.push(Some(pair));
        }

        let oid = ObjectId(self.objects.len() as u32);
        self.objects.push(ObjectEntry { ptr, len, mode, chunk_stride });
        debug!("add_object: OID {} len {} stride {}", oid.0, len, chunk_stride);
        Ok(oid)
    }

    pub fn object_len(&self, oid: ObjectId) -> Result<usize> {
        self.object_entry(oid).map(|o| o.len)
    }

    pub fn object_mode(&self, oid: ObjectId) -> Result<ObjectMode> {
        self.object_entry(oid).map(|o| o.mode)
    }

    pub fn chunk_stride(&self, oid: ObjectId) -> Result<usize> {
        self.object_entry(oid).map(|o| o.chunk_stride)
    }

    /// Number of chunks (buffer ids) the object spans.
    pub fn num_chunks(&self, oid: ObjectId) -> Result<usize> {
        let obj = self.object_entry(oid)?;
        Ok((obj.len + obj.chunk_stride - 1) / obj.chunk_stride)
    }

    /// Makes the byte range `[begin, end)` of `oid` resident on the device
    /// of `queue` and locks its slot.
    ///
    /// On a miss the supplied `wait` events are waited for on the host
    /// before the range is copied into the pinned staging buffer; the
    /// returned [`CacheEntry::event`] then tracks the asynchronous
    /// host→device write. On a hit no transfer is issued and no event is
    /// returned.
    pub fn get(
        &mut self,
        queue: &Queue,
        oid: ObjectId,
        begin: usize,
        end: usize,
        wait: &[Event],
    ) -> Result<CacheEntry> {
        let bid = self.buffer_id(oid, begin, end)?;
        let size = end - begin;
        let did = self
            .find_device(queue.device())
            .ok_or_else(|| Error::InvalidArgument("get: unknown device".into()))?;

        let obj_ptr = self.objects[oid.idx()].ptr;
        let slot = slot_mut(&mut self.devices[did], oid, bid)?;

        if slot.tenant == Some((oid, bid)) {
            if slot.locked {
                return Err(Error::ResourceExhausted(format!(
                    "get: slot for OID {} BID {} is still locked",
                    oid.0, bid
                )));
            }
            slot.locked = true;
            debug!("get: hit OID {} BID {} DID {}", oid.0, bid, did);
            return Ok(CacheEntry {
                buffer: slot.device_buffer.clone(),
                len: size,
                event: None,
            });
        }

        if slot.locked {
            let (toid, tbid) = slot.tenant.unwrap_or((ObjectId::NULL, 0));
            return Err(Error::ResourceExhausted(format!(
                "get: slot {} of OID {} is locked by tenancy ({}, {})",
                bid % NUM_SLOTS,
                oid.0,
                toid.0,
                tbid
            )));
        }

        // Miss: the staging copy must not run ahead of prior consumers of
        // this range.
        for ev in wait {
            ev.wait_for()?;
        }

        debug!("get: stage OID {} BID {} DID {} ({} bytes)", oid.0, bid, did, size);
        let src = unsafe { slice::from_raw_parts(obj_ptr.add(begin), size) };
        slot.host_map[..size].copy_from_slice(src);

        let mut event = Event::empty();
        unsafe {
            slot.device_buffer
                .cmd()
                .queue(queue)
                .write(&slot.host_map[..size])
                .block(false)
                .enew(&mut event)
                .enq()?;
        }

        slot.locked = true;
        slot.tenant = Some((oid, bid));

        Ok(CacheEntry {
            buffer: slot.device_buffer.clone(),
            len: size,
            event: Some(event),
        })
    }

    /// Drains the resident byte range `[begin, end)` of `oid` back into the
    /// object's host memory and returns the device→host read event.
    ///
    /// The range must currently be resident; there is no implicit staging
    /// or write-back of evicted chunks.
    pub fn read(&mut self, queue: &Queue, oid: ObjectId, begin: usize, end: usize) -> Result<Event> {
        let bid = self.buffer_id(oid, begin, end)?;
        let size = end - begin;
        let did = self
            .find_device(queue.device())
            .ok_or_else(|| Error::InvalidArgument("read: unknown device".into()))?;

        let obj_ptr = self.objects[oid.idx()].ptr;
        let slot = slot_mut(&mut self.devices[did], oid, bid)?;

        if slot.tenant != Some((oid, bid)) {
            return Err(Error::InvalidArgument(format!(
                "read: OID {} BID {} is not resident",
                oid.0, bid
            )));
        }

        let mut event = Event::empty();
        slot.device_buffer
            .cmd()
            .queue(queue)
            .read(&mut slot.host_map[..size])
            .enew(&mut event)
            .enq()?;

        let dst = unsafe { slice::from_raw_parts_mut(obj_ptr.add(begin), size) };
        dst.copy_from_slice(&slot.host_map[..size]);

        debug!("read: OID {} BID {} DID {} ({} bytes)", oid.0, bid, did, size);
        Ok(event)
    }

    /// Releases the slot holding the chunk of `oid` that contains byte
    /// offset `begin`. Must be called exactly once per successful `get`,
    /// after the consuming event has completed.
    pub fn unlock(&mut self, device: Device, oid: ObjectId, begin: usize) -> Result<()> {
        let did = self
            .find_device(device)
            .ok_or_else(|| Error::InvalidArgument("unlock: unknown device".into()))?;
        let obj = self.object_entry(oid)?;
        if begin >= obj.len {
            return Err(Error::InvalidArgument("unlock: offset out of bounds".into()));
        }
        let bid = begin / obj.chunk_stride;

        let slot = slot_mut(&mut self.devices[did], oid, bid)?;
        if slot.tenant != Some((oid, bid)) {
            return Err(Error::InvalidArgument(format!(
                "unlock: no slot holds OID {} BID {}",
                oid.0, bid
            )));
        }

        debug!("unlock: OID {} BID {} DID {}", oid.0, bid, did);
        slot.locked = false;
        Ok(())
    }

    /// Maps a byte range onto its buffer id, validating bounds, size and
    /// alignment (the range must not straddle a chunk boundary).
    pub(crate) fn buffer_id(&self, oid: ObjectId, begin: usize, end: usize) -> Result<usize> {
        let obj = self.object_entry(oid)?;
        if begin >= end || end > obj.len {
            return Err(Error::InvalidArgument(format!(
                "range [{}, {}) outside object of {} bytes",
                begin, end, obj.len
            )));
        }
        if end - begin > self.buffer_size {
            return Err(Error::InvalidArgument(format!(
                "range of {} bytes exceeds the buffer size {}",
                end - begin,
                self.buffer_size
            )));
        }
        let stride = obj.chunk_stride;
        if begin / stride != (end - 1) / stride {
            return Err(Error::InvalidArgument(format!(
                "range [{}, {}) straddles a chunk boundary (stride {})",
                begin, end, stride
            )));
        }
        Ok(begin / stride)
    }

    fn object_entry(&self, oid: ObjectId) -> Result<&ObjectEntry> {
        if oid.is_null() || oid.idx() >= self.objects.len() {
            return Err(Error::InvalidArgument(format!("unknown object id {}", oid.0)));
        }
        Ok(&self.objects[oid.idx()])
    }

    fn find_device(&self, device: Device) -> Option<usize> {
        self.devices.iter().position(|d| d.device == device)
    }
}

fn slot_mut(dev: &mut DeviceEntry, oid: ObjectId, bid: usize) -> Result<&mut Slot> {
    let pair = dev
        .slots
        .get_mut(oid.idx())
        .and_then(|p| p.as_mut())
        .ok_or_else(|| Error::InvalidArgument(format!("unknown object id {}", oid.0)))?;
    Ok(&mut pair[bid % NUM_SLOTS])
}

fn alloc_slot_pair(dev: &mut DeviceEntry, buffer_size: usize) -> Result<[Slot; NUM_SLOTS]> {
    if dev.pool_used + NUM_SLOTS * buffer_size > dev.pool_size {
        return Err(Error::ResourceExhausted(format!(
            "slot pair of 2 x {} bytes overflows pool budget {} ({} in use)",
            buffer_size, dev.pool_size, dev.pool_used
        )));
    }

    let mut mk = || -> Result<Slot> {
        let device_buffer = Buffer::<u8>::builder()
            .context(&dev.context)
            .flags(MemFlags::new().read_write())
            .len(buffer_size)
            .build()?;
        let host_buffer = Buffer::<u8>::builder()
            .context(&dev.context)
            .flags(MemFlags::new().read_write().alloc_host_ptr())
            .len(buffer_size)
            .build()?;
        let host_map = unsafe {
            host_buffer
                .map()
                .queue(&dev.map_queue)
                .flags(MapFlags::new().read().write())
                .len(buffer_size)
                .enq()?
        };
        Ok(Slot {
            device_buffer,
            host_map,
            _host_buffer: host_buffer,
            locked: false,
            tenant: None,
        })
    };

    let pair = [mk()?, mk()?];
    dev.pool_used += NUM_SLOTS * buffer_size;
    Ok(pair)
}
