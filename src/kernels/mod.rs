//! Kernel adapters.
//!
//! Each adapter wraps one OpenCL program: `prepare` compiles it with the
//! element-type defines and allocates any scratch; `invoke` sets the
//! arguments, launches and returns the completion event. The `.cl` sources
//! live under `src/kernels/cl` and are embedded at compile time.
//!
//! Cache slots are untyped byte buffers, so the kernels are built with
//! argument type checking disabled and the adapters carry the element
//! types as generic parameters instead.

mod centroid_update;
mod fused;
mod labeling;
mod mass_update;
mod matrix_op;
mod reduce;

pub use self::centroid_update::CentroidUpdate;
pub use self::fused::Fused;
pub use self::labeling::Labeling;
pub use self::mass_update::MassUpdate;
pub use self::matrix_op::RowDivide;
pub use self::reduce::Reduce;

use std::ops::{Add, Div, Mul, Sub};

use ocl::{Context, Device, OclPrm, Program};

use crate::error::Result;

/// A scalar that can cross the host/device boundary.
pub trait ClNum: OclPrm + Default + PartialEq + std::fmt::Debug + 'static {
    /// The OpenCL spelling of the type.
    const TYPE_NAME: &'static str;
}

impl ClNum for f32 {
    const TYPE_NAME: &'static str = "float";
}

impl ClNum for f64 {
    const TYPE_NAME: &'static str = "double";
}

impl ClNum for u32 {
    const TYPE_NAME: &'static str = "uint";
}

impl ClNum for u64 {
    const TYPE_NAME: &'static str = "ulong";
}

/// Point element types (feature values, centroids).
pub trait ClPoint:
    ClNum
    + PartialOrd
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
{
    /// Spelling of the largest finite value, for distance seeding.
    const MAX_LITERAL: &'static str;
    const IS_DOUBLE: bool;

    fn from_usize(v: usize) -> Self;
}

impl ClPoint for f32 {
    const MAX_LITERAL: &'static str = "FLT_MAX";
    const IS_DOUBLE: bool = false;

    fn from_usize(v: usize) -> f32 {
        v as f32
    }
}

impl ClPoint for f64 {
    const MAX_LITERAL: &'static str = "DBL_MAX";
    const IS_DOUBLE: bool = true;

    fn from_usize(v: usize) -> f64 {
        v as f64
    }
}

/// Label element types (cluster assignments).
pub trait ClLabel: ClNum {
    fn from_usize(v: usize) -> Self;
    fn to_usize(self) -> usize;
}

impl ClLabel for u32 {
    fn from_usize(v: usize) -> u32 {
        v as u32
    }

    fn to_usize(self) -> usize {
        self as usize
    }
}

impl ClLabel for u64 {
    fn from_usize(v: usize) -> u64 {
        v as u64
    }

    fn to_usize(self) -> usize {
        self as usize
    }
}

/// Mass (cluster size) element types.
pub trait ClMass: ClNum + Add<Output = Self> {
    /// Whether OpenCL 1.x global atomics cover the type (32-bit only).
    const HAS_GLOBAL_ATOMIC: bool;

    fn from_usize(v: usize) -> Self;
    fn to_usize(self) -> usize;
}

impl ClMass for u32 {
    const HAS_GLOBAL_ATOMIC: bool = true;

    fn from_usize(v: usize) -> u32 {
        v as u32
    }

    fn to_usize(self) -> usize {
        self as usize
    }
}

impl ClMass for u64 {
    const HAS_GLOBAL_ATOMIC: bool = false;

    fn from_usize(v: usize) -> u64 {
        v as u64
    }

    fn to_usize(self) -> usize {
        self as usize
    }
}

pub(crate) fn point_defines<P: ClPoint>() -> Vec<String> {
    let mut defines = vec![
        format!("-DPOINT_T={}", P::TYPE_NAME),
        format!("-DPOINT_MAX={}", P::MAX_LITERAL),
    ];
    if P::IS_DOUBLE {
        defines.push("-DPOINT_IS_DOUBLE".to_string());
    }
    defines
}

pub(crate) fn label_define<L: ClLabel>() -> String {
    format!("-DLABEL_T={}", L::TYPE_NAME)
}

pub(crate) fn mass_define<M: ClMass>() -> String {
    format!("-DMASS_T={}", M::TYPE_NAME)
}

pub(crate) fn build_program(
    context: &Context,
    device: Device,
    src: &str,
    defines: &[String],
) -> Result<Program> {
    let mut builder = Program::builder();
    builder.devices(device).src(src);
    for define in defines {
        builder.cmplr_opt(define.clone());
    }
    Ok(builder.build(context)?)
}
