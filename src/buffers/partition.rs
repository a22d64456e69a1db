//! How an array's elements are divided across devices.
//!
//! Two rules coexist:
//!
//! - **Allocation**: every device gets `total / n` elements except the last,
//!   which also gets `total % n`.
//! - **Transfer and work**: device 0 gets `total / n` elements starting at 0;
//!   every device `i > 0` gets `total / n + total % n` starting at
//!   `i * (total / n)`.
//!
//! They agree when `n <= 2` or `total % n == 0`. Otherwise a middle device is
//! asked to move more elements than its buffer holds, the device rejects the
//! copy, and the function falls back to host threads.

use crate::array::Span;

/// Elements device `index` of `devices` allocates for a split array.
pub fn allocation_len(total: usize, devices: usize, index: usize) -> usize {
    let devices = devices.max(1);
    let base = total / devices;
    if index == devices - 1 {
        base + total % devices
    } else {
        base
    }
}

/// Host range device `index` copies in and out.
pub fn transfer_span(total: usize, devices: usize, index: usize) -> Span {
    let devices = devices.max(1);
    let base = total / devices;
    if index == 0 {
        Span::new(0, base)
    } else {
        Span::new(index * base, base + total % devices)
    }
}

/// Work-items launched on device `index`.
pub fn work_items(total: usize, devices: usize, index: usize) -> usize {
    transfer_span(total, devices, index).len
}

/// How a device buffer set is sized relative to the host array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Partitioning {
    /// Every device holds the whole array.
    Replicated,
    /// The array is divided across `devices` devices.
    Split { devices: usize },
}

impl Partitioning {
    pub fn for_devices(devices: usize) -> Self {
        if devices <= 1 {
            Partitioning::Replicated
        } else {
            Partitioning::Split { devices }
        }
    }

    pub fn allocation_len(&self, total: usize, index: usize) -> usize {
        match *self {
            Partitioning::Replicated => total,
            Partitioning::Split { devices } => allocation_len(total, devices, index),
        }
    }

    pub fn transfer_span(&self, total: usize, index: usize) -> Span {
        match *self {
            Partitioning::Replicated => Span::new(0, total),
            Partitioning::Split { devices } => transfer_span(total, devices, index),
        }
    }
}
