//! The device-compute API the runtime drives.
//!
//! Everything above this module talks to devices through [`DeviceApi`]:
//! buffers, asynchronous copies tracked by [`Event`]s, program builds and
//! kernel launches. Two implementations ship with the crate:
//!
//! - [`HostDevice`]: keeps buffers in host memory and runs kernels that were
//!   registered as Rust functions under their entry-point name.
//! - [`WgpuDevice`]: WGSL compute over wgpu (Metal, Vulkan, DX12).

mod event;
pub mod gpu;
pub mod host;
pub mod shaders;

use std::fmt;

pub use event::{wait_all, Event, EventTiming};
pub use gpu::WgpuDevice;
pub use host::{Faults, HostArg, HostDevice, HostInvocation, HostKernels};

// ─── Handles ───────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KernelId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// How a kernel may access a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemFlags {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// A value bound to one kernel parameter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KernelArg {
    Buffer(BufferId),
    /// Little-endian bytes of a scalar passed by value.
    Scalar(Vec<u8>),
}

// ─── Errors ────────────────────────────────────────────────────────

/// Failures reported by a device backend.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("out of device memory ({requested} bytes requested)")]
    OutOfMemory { requested: usize },

    #[error("invalid buffer handle {0}")]
    InvalidBuffer(BufferId),

    #[error("access of {len} bytes at offset {offset} exceeds buffer of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("program build failed: {0}")]
    Build(String),

    #[error("no kernel named `{0}` in program")]
    MissingKernel(String),

    #[error("invalid kernel or program handle")]
    InvalidHandle,

    #[error("kernel argument {0} is not set")]
    UnsetArgument(u32),

    #[error("invalid work size: global {global}, local {local}")]
    InvalidWorkSize { global: usize, local: usize },

    #[error("kernel execution failed: {0}")]
    Execution(String),

    #[error("{0}")]
    Backend(String),
}

// ─── Device API ────────────────────────────────────────────────────

/// One compute device with its own memory and command queue.
///
/// Every size and offset is in bytes. Writes copy their input before
/// returning, so the caller's buffer may be reused once the call returns;
/// the returned [`Event`] tracks device-side completion.
pub trait DeviceApi: Send + Sync {
    fn name(&self) -> &str;

    /// Largest work-group the device accepts.
    fn max_work_group_size(&self) -> usize;

    fn create_buffer(&self, flags: MemFlags, size: usize) -> Result<BufferId, DeviceError>;

    fn release_buffer(&self, buffer: BufferId);

    fn enqueue_write(&self, buffer: BufferId, offset: usize, data: &[u8]) -> Result<Event, DeviceError>;

    /// The returned event's payload holds the bytes read.
    fn enqueue_read(&self, buffer: BufferId, offset: usize, size: usize) -> Result<Event, DeviceError>;

    fn build_program(&self, source: &str) -> Result<ProgramId, DeviceError>;

    /// Device binary of a built program.
    fn program_binary(&self, program: ProgramId) -> Result<Vec<u8>, DeviceError>;

    fn create_kernel(&self, program: ProgramId, entry_point: &str) -> Result<KernelId, DeviceError>;

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: KernelArg) -> Result<(), DeviceError>;

    /// Launch `global` work-items. `None` lets the driver pick the local size.
    fn enqueue_kernel(&self, kernel: KernelId, global: usize, local: Option<usize>) -> Result<Event, DeviceError>;

    fn wait_for_events(&self, events: &[Event]) -> Result<(), DeviceError> {
        wait_all(events)
    }
}
