//! Binding arguments and enqueueing a compiled kernel on each device.

pub mod args;

use std::sync::Arc;

use crate::cache::CompiledKernel;
use crate::device::{DeviceApi, Event, KernelArg};
use crate::error::{Error, Result};
use crate::profiler::{ProfileEvent, ProfileKind, TimestampSink};

pub use args::{argument_layout, ArgSource, Bindings};

/// Local work size for a launch of `global` items, or `None` to let the
/// device choose when the largest usable group does not divide `global`.
pub fn local_work_size(max_work_group_size: usize, global: usize) -> Option<usize> {
    if global == 0 {
        return None;
    }
    let local = max_work_group_size.min(global).max(1);
    (global % local == 0).then_some(local)
}

/// One device's share of a launch.
pub struct DeviceLaunch<'a> {
    pub device_index: usize,
    pub device: &'a dyn DeviceApi,
    pub kernel: &'a CompiledKernel,
    pub args: Vec<KernelArg>,
    pub work_items: usize,
}

impl DeviceLaunch<'_> {
    /// Wait for `after`, bind every argument and enqueue the kernel.
    ///
    /// Returns `None` when there is no work for this device.
    pub fn enqueue(self, after: &[Event], sink: &Arc<dyn TimestampSink>) -> Result<Option<Event>> {
        let index = self.device_index;
        self.device
            .wait_for_events(after)
            .map_err(Error::enqueue(index, "wait for copies"))?;
        if self.work_items == 0 {
            return Ok(None);
        }

        let local = local_work_size(self.device.max_work_group_size(), self.work_items);
        let event = {
            let _launch = self.kernel.lock_launch();
            for (position, arg) in self.args.into_iter().enumerate() {
                self.device
                    .set_kernel_arg(self.kernel.kernel, position as u32, arg)
                    .map_err(Error::enqueue(index, "set kernel argument"))?;
            }
            self.device
                .enqueue_kernel(self.kernel.kernel, self.work_items, local)
                .map_err(Error::enqueue(index, "enqueue kernel"))?
        };
        tracing::trace!(device = index, global = self.work_items, ?local, entry = %self.kernel.entry_point, "kernel enqueued");

        let sink = Arc::clone(sink);
        event.on_complete(move |timing| {
            sink.record(ProfileEvent {
                kind: ProfileKind::Kernel,
                device: Some(index),
                duration: timing.duration(),
            })
        });
        Ok(Some(event))
    }
}
