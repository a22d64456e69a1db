//! Moving column data between typed arrays and device buffer sets.
//!
//! Copies are issued non-blocking; each returns its completion [`Event`] with
//! a profiling callback attached. Device failures are reported as
//! [`Error::DeviceEnqueue`] naming the operation.
//!
//! A device buffer always starts at the first element of that device's
//! share, so device offsets are zero and only the host side is offset.

use std::sync::Arc;

use rayon::prelude::*;

use crate::array::{Element, Span, TypedArray};
use crate::buffers::{DeviceArray, DeviceBufferSet, Partitioning};
use crate::device::{BufferId, DeviceApi, Event};
use crate::error::{Error, Result};
use crate::kernel::ScopeVariable;
use crate::profiler::{ProfileEvent, ProfileKind, TimestampSink};

fn enqueue_write(
    device: &dyn DeviceApi,
    index: usize,
    buffer: BufferId,
    bytes: &[u8],
    kind: ProfileKind,
    sink: &Arc<dyn TimestampSink>,
) -> Result<Event> {
    let event = device
        .enqueue_write(buffer, 0, bytes)
        .map_err(Error::enqueue(index, "write buffer"))?;
    let sink = Arc::clone(sink);
    event.on_complete(move |timing| {
        sink.record(ProfileEvent {
            kind,
            device: Some(index),
            duration: timing.duration(),
        })
    });
    Ok(event)
}

fn int_bytes(values: &[i32]) -> Vec<u8> {
    let le: Vec<i32> = values.iter().map(|v| v.to_le()).collect();
    bytemuck::cast_slice(&le).to_vec()
}

// ─── Copy In ───────────────────────────────────────────────────────

/// Write the `span` elements of every column of `array` into `set`.
///
/// A sequence writes its two describing ints, rebased so the device's first
/// element is `span.offset`.
pub fn copy_in<T: Element>(
    device: &dyn DeviceApi,
    array: &TypedArray<T>,
    set: &DeviceBufferSet,
    span: Span,
    sink: &Arc<dyn TimestampSink>,
) -> Result<Vec<Event>> {
    let index = set.device_index();
    let mut events = Vec::with_capacity(set.columns().len());

    if let Some(seq) = array.sequence_info() {
        if let Some(column) = set.columns().first() {
            let bytes = int_bytes(&[seq.value_at(span.offset), seq.step]);
            events.push(enqueue_write(device, index, column.id, &bytes, ProfileKind::WriteBuffer, sink)?);
        }
        return Ok(events);
    }

    for (column, buffer) in array.columns().iter().zip(set.columns()) {
        let stride = column.layout().stride();
        let bytes = column
            .bytes()
            .get(span.offset * stride..span.end() * stride)
            .ok_or(Error::ShapeMismatch {
                expected: span.end(),
                found: array.stored_len(),
            })?;
        if bytes.is_empty() {
            continue;
        }
        events.push(enqueue_write(device, index, buffer.id, bytes, ProfileKind::WriteBuffer, sink)?);
    }
    Ok(events)
}

/// Write `ints` into the set's metadata buffer, if it has one.
pub fn copy_metadata(
    device: &dyn DeviceApi,
    set: &DeviceBufferSet,
    ints: &[i32],
    sink: &Arc<dyn TimestampSink>,
) -> Result<Option<Event>> {
    let Some(meta) = set.metadata() else {
        return Ok(None);
    };
    let mut values = ints.to_vec();
    values.resize(meta.layout.lanes, 0);
    let event = enqueue_write(
        device,
        set.device_index(),
        meta.id,
        &int_bytes(&values),
        ProfileKind::WriteBufferMetadata,
        sink,
    )?;
    Ok(Some(event))
}

/// Copy each device's share of `array` plus its element count, concurrently
/// across devices. Returns the events per device.
pub fn copy_in_all<T: Element>(
    devices: &[Arc<dyn DeviceApi>],
    array: &TypedArray<T>,
    sets: &DeviceArray,
    partitioning: Partitioning,
    sink: &Arc<dyn TimestampSink>,
) -> Result<Vec<Vec<Event>>> {
    sets.sets()
        .par_iter()
        .zip(devices.par_iter())
        .map(|(set, device)| {
            let span = partitioning.transfer_span(array.len(), set.device_index());
            let mut events = copy_in(device.as_ref(), array, set, span, sink)?;
            events.extend(copy_metadata(device.as_ref(), set, &[span.len as i32], sink)?);
            Ok(events)
        })
        .collect()
}

/// Upload a captured array into its scope set: data, then `{total_bytes, 0}`.
pub fn upload_scope(
    device: &dyn DeviceApi,
    var: &ScopeVariable,
    set: &DeviceBufferSet,
    sink: &Arc<dyn TimestampSink>,
) -> Result<Vec<Event>> {
    let ScopeVariable::ArrayLike {
        staged, total_bytes, ..
    } = var
    else {
        return Ok(Vec::new());
    };
    let mut events = Vec::with_capacity(2);
    if let Some(column) = set.columns().first() {
        if !staged.is_empty() {
            events.push(enqueue_write(
                device,
                set.device_index(),
                column.id,
                staged,
                ProfileKind::WriteBuffer,
                sink,
            )?);
        }
    }
    events.extend(copy_metadata(device, set, &[*total_bytes as i32, 0], sink)?);
    Ok(events)
}

// ─── Copy Out ──────────────────────────────────────────────────────

struct PendingRead {
    column: usize,
    host_offset: usize,
    event: Event,
}

/// Reads issued for one device, waiting to land in a host array.
#[must_use]
pub struct Readback {
    device: usize,
    reads: Vec<PendingRead>,
}

impl Readback {
    /// Wait for every read and copy the bytes into `array`.
    pub fn land<T: Element>(self, array: &mut TypedArray<T>) -> Result<()> {
        let stored = array.stored_len();
        for read in self.reads {
            read.event
                .wait()
                .map_err(Error::enqueue(self.device, "read buffer"))?;
            let bytes = read.event.take_payload().unwrap_or_default();
            let column = &mut array.columns_mut()[read.column];
            let target = column
                .bytes_mut()
                .get_mut(read.host_offset..read.host_offset + bytes.len())
                .ok_or(Error::ShapeMismatch {
                    expected: read.host_offset + bytes.len(),
                    found: stored,
                })?;
            target.copy_from_slice(&bytes);
        }
        Ok(())
    }
}

/// Issue reads of the `span` share of every column in `set`.
pub fn copy_out(
    device: &dyn DeviceApi,
    set: &DeviceBufferSet,
    span: Span,
    sink: &Arc<dyn TimestampSink>,
) -> Result<Readback> {
    let index = set.device_index();
    let mut reads = Vec::with_capacity(set.columns().len());
    for (column, buffer) in set.columns().iter().enumerate() {
        let stride = buffer.layout.stride();
        let size = span.len * stride;
        if size == 0 {
            continue;
        }
        let event = device
            .enqueue_read(buffer.id, 0, size)
            .map_err(Error::enqueue(index, "read buffer"))?;
        let sink = Arc::clone(sink);
        event.on_complete(move |timing| {
            sink.record(ProfileEvent {
                kind: ProfileKind::ReadBuffer,
                device: Some(index),
                duration: timing.duration(),
            })
        });
        reads.push(PendingRead {
            column,
            host_offset: span.offset * stride,
            event,
        });
    }
    Ok(Readback { device: index, reads })
}

/// Read every device's share back into `array`.
pub fn copy_out_all<T: Element>(
    devices: &[Arc<dyn DeviceApi>],
    array: &mut TypedArray<T>,
    sets: &DeviceArray,
    partitioning: Partitioning,
    sink: &Arc<dyn TimestampSink>,
) -> Result<()> {
    let total = array.len();
    let pending = sets
        .sets()
        .iter()
        .zip(devices)
        .map(|(set, device)| {
            let span = partitioning.transfer_span(total, set.device_index());
            copy_out(device.as_ref(), set, span, sink)
        })
        .collect::<Result<Vec<_>>>()?;
    for readback in pending {
        readback.land(array)?;
    }
    Ok(())
}
