//! Typed arrays that map over heterogeneous compute devices.
//!
//! Host data lives in [`TypedArray`]s stored column-per-field. An
//! [`exec::MapAccelerator`] copies an array to every active device, runs the
//! function's kernel over each device's share and copies the result back,
//! falling back to host threads for good when the device path fails.

pub mod array;
pub mod buffers;
pub mod cache;
pub mod config;
pub mod deopt;
pub mod device;
pub mod error;
pub mod exec;
pub mod kernel;
pub mod launch;
pub mod marshal;
pub mod profiler;
pub mod runtime;
pub mod types;

// Re-exports: the types most callers touch
pub use array::{Element, Slice, SliceMut, Span, TypedArray};
pub use config::RuntimeOptions;
pub use error::{Error, Result};
pub use exec::{ArrayFunction, Map, MapAccelerator, MapThreads, Pipeline};
pub use kernel::{Captures, FunctionId};
pub use runtime::RuntimeContext;
pub use types::{ScalarKind, TypeDescriptor};
