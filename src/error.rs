//! Error taxonomy for the array runtime.
//!
//! Device backends report [`DeviceError`](crate::device::DeviceError); the
//! marshalling and launch layers translate those into [`Error`] so that raw
//! driver failures never reach callers.

use crate::device::DeviceError;

/// Result type used across the runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while describing, moving or running arrays.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A value's shape is outside the scalar / tuple / array set.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// Device memory could not be reserved. Not recoverable for the call.
    #[error("device {device}: allocation of {bytes} bytes failed: {source}")]
    DeviceAllocation {
        device: usize,
        bytes: usize,
        #[source]
        source: DeviceError,
    },

    /// A copy, argument binding or launch was rejected by the device.
    #[error("device {device}: {operation} failed: {source}")]
    DeviceEnqueue {
        device: usize,
        operation: &'static str,
        #[source]
        source: DeviceError,
    },

    /// The device could not build the generated kernel source.
    #[error("kernel compilation failed on device {device}: {reason}")]
    KernelCompile { device: usize, reason: String },

    /// The source generator could not produce a kernel for the function.
    #[error("kernel generation failed for `{function}`: {reason}")]
    KernelGeneration { function: String, reason: String },

    /// A kernel raised its deoptimization guard.
    #[error("deoptimization guard raised on device {device}")]
    DeoptGuard { device: usize },

    /// No device is available for offload.
    #[error("no compute devices available")]
    NoDevices,

    #[error("invalid partition: {0}")]
    InvalidPartition(String),

    #[error("shape mismatch: expected {expected} elements, found {found}")]
    ShapeMismatch { expected: usize, found: usize },

    /// Captured scope variables do not form a valid slot assignment.
    #[error("invalid scope capture: {0}")]
    InvalidScope(String),

    #[error("pipeline: {0}")]
    Pipeline(String),

    #[error("invalid option `{key}`: {reason}")]
    Config { key: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this failure moves the function onto host threads for good.
    pub fn triggers_deopt(&self) -> bool {
        matches!(
            self,
            Error::DeviceEnqueue { .. }
                | Error::KernelCompile { .. }
                | Error::KernelGeneration { .. }
                | Error::DeoptGuard { .. }
                | Error::NoDevices
        )
    }

    pub(crate) fn enqueue(device: usize, operation: &'static str) -> impl FnOnce(DeviceError) -> Error {
        move |source| Error::DeviceEnqueue {
            device,
            operation,
            source,
        }
    }
}
