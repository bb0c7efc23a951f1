//! Error and result types for the clustering engine.

use std::result;

/// Crate-wide result type.
pub type Result<T> = result::Result<T, Error>;

/// The failure kinds of the clustering engine.
///
/// Cache and scheduler validation failures surface as `InvalidArgument` or
/// `ResourceExhausted`; anything raised by the OpenCL runtime is wrapped in
/// `DeviceFailure`. Reaching the iteration limit without stable labels is a
/// normal terminal state and is *not* represented here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown object id, range out of bounds, unaligned range, unknown
    /// device, pool budget too small, mismatched chunk counts.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No unlocked slot is available for the requested tenancy, or a slot
    /// pair would overflow the device pool budget.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An error reported by the OpenCL runtime.
    #[error("device failure: {0}")]
    DeviceFailure(#[from] ocl::Error),

    /// The configured `(point, label, mass)` triple is not supported by
    /// this build, or an input file carries a different element type.
    #[error("unsupported type combination: {0}")]
    TypeMismatch(String),

    /// Malformed configuration or a missing required key.
    #[error("configuration error: {0}")]
    ConfigParse(String),

    /// File-system failure while reading input or writing output.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ocl::OclCoreError> for Error {
    fn from(err: ocl::OclCoreError) -> Error {
        Error::DeviceFailure(err.into())
    }
}

impl Error {
    /// Short category name, printed ahead of the details on the
    /// diagnostic stream.
    pub fn category(&self) -> &'static str {
        match *self {
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::ResourceExhausted(_) => "ResourceExhausted",
            Error::DeviceFailure(_) => "DeviceFailure",
            Error::TypeMismatch(_) => "TypeMismatch",
            Error::ConfigParse(_) => "ConfigParse",
            Error::Io(_) => "Io",
        }
    }
}
