//! Iteration controllers.
//!
//! Both controllers stream the point set through the buffer cache and
//! scheduler once per iteration, poll the device-side did-changes flag
//! after the stages complete, and stop on convergence or at the iteration
//! limit. Convergence failure (hitting the limit with unstable labels) is
//! a normal terminal state.

mod fused;
mod three_stage;

pub use self::fused::FusedPipeline;
pub use self::three_stage::ThreeStagePipeline;

use std::mem;

use ocl::enums::{DeviceInfo, DeviceInfoResult};
use ocl::flags::CommandQueueProperties;
use ocl::{Buffer, Context, Device, Platform, Queue};

use crate::error::{Error, Result};
use crate::kernels::{ClLabel, ClMass, ClPoint};
use crate::matrix::Matrix;
use crate::measurement::Measurement;

/// Headroom left to the OpenCL runtime when sizing the cache pool from
/// device memory.
const POOL_HEADROOM: usize = 64 << 20;

/// The result of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput<P, L, M> {
    /// Column-major `k x num_features`.
    pub centroids: Vec<P>,
    pub labels: Vec<L>,
    pub masses: Vec<M>,
    pub iterations: u32,
}

/// Common driver interface of the two controllers.
pub trait KmeansPipeline<P: ClPoint, L: ClLabel, M: ClMass> {
    fn run(&mut self, points: &Matrix<P>, measurement: &mut Measurement)
        -> Result<RunOutput<P, L, M>>;
}

/// Resolves `(platform index, device index)` into an opened device with a
/// profiling-enabled main queue.
pub(crate) struct DeviceHandle {
    pub device: Device,
    pub context: Context,
    pub queue: Queue,
}

pub(crate) fn open_device(platform_idx: usize, device_idx: usize) -> Result<DeviceHandle> {
    let platforms = Platform::list();
    let platform = platforms.get(platform_idx).cloned().ok_or_else(|| {
        Error::InvalidArgument(format!(
            "platform index {} out of range ({} available)",
            platform_idx,
            platforms.len()
        ))
    })?;
    let devices = Device::list_all(platform).map_err(ocl::Error::from)?;
    let device = devices.get(device_idx).cloned().ok_or_else(|| {
        Error::InvalidArgument(format!(
            "device index {} out of range ({} available on platform {})",
            device_idx,
            devices.len(),
            platform_idx
        ))
    })?;
    let context = Context::builder().platform(platform).devices(device).build()?;
    let queue = Queue::new(&context, device, Some(CommandQueueProperties::new().profiling()))?;
    Ok(DeviceHandle { device, context, queue })
}

/// The cache pool budget for a device: global memory minus headroom,
/// floored so a slot pair always fits.
pub(crate) fn pool_budget(device: Device, buffer_size: usize) -> usize {
    let global_mem = match device.info(DeviceInfo::GlobalMemSize) {
        Ok(DeviceInfoResult::GlobalMemSize(bytes)) => bytes as usize,
        _ => 0,
    };
    global_mem
        .saturating_sub(POOL_HEADROOM)
        .max(2 * buffer_size + 1)
}

/// Byte geometry of one streamed chunk pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkGeometry {
    pub points_per_chunk: usize,
    pub point_chunk_bytes: usize,
    pub label_chunk_bytes: usize,
}

pub(crate) fn chunk_geometry<P: ClPoint, L: ClLabel>(
    buffer_size: usize,
    num_points: usize,
    num_features: usize,
) -> Result<ChunkGeometry> {
    let point_row = num_features * mem::size_of::<P>();
    if point_row == 0 || point_row > buffer_size {
        return Err(Error::InvalidArgument(format!(
            "a point of {} features ({} bytes) does not fit the buffer size {}",
            num_features, point_row, buffer_size
        )));
    }

    let points_per_chunk = (buffer_size / point_row)
        .min(buffer_size / mem::size_of::<L>())
        .min(num_points);

    Ok(ChunkGeometry {
        points_per_chunk,
        point_chunk_bytes: points_per_chunk * point_row,
        label_chunk_bytes: points_per_chunk * mem::size_of::<L>(),
    })
}

/// Zero-fills a device buffer on `queue`.
pub(crate) fn fill_zero<T: ocl::OclPrm + Default>(queue: &Queue, buffer: &Buffer<T>) -> Result<()> {
    buffer.cmd().queue(queue).fill(T::default(), None).enq()?;
    Ok(())
}
