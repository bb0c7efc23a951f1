//! Device-dependent integration tests.
//!
//! These run against the first available OpenCL device and skip
//! themselves (with a note on stderr) when no platform is installed.
//! Host-only unit tests live next to the code they cover.

pub mod cache;
pub mod scheduler;

use ocl::flags::CommandQueueProperties;
use ocl::{Context, Device, Platform, Queue};

pub(crate) struct TestDevice {
    pub device: Device,
    pub context: Context,
    pub queue: Queue,
}

pub(crate) fn test_device() -> Option<TestDevice> {
    let platform_ids = ocl::core::get_platform_ids().ok()?;
    let platform = Platform::new(platform_ids.first()?.clone());
    let devices = Device::list_all(platform).ok()?;
    let device = *devices.first()?;
    let context = Context::builder()
        .platform(platform)
        .devices(device)
        .build()
        .ok()?;
    let queue = Queue::new(
        &context,
        device,
        Some(CommandQueueProperties::new().profiling()),
    )
    .ok()?;
    Some(TestDevice { device, context, queue })
}

macro_rules! require_device {
    () => {
        match crate::tests::test_device() {
            Some(td) => td,
            None => {
                eprintln!("skipping: no OpenCL device available");
                return;
            }
        }
    };
}

pub(crate) use require_device;
