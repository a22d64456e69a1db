//! Device buffer sets and the registry that keeps them alive across calls.
//!
//! A [`DeviceBufferSet`] is what one array occupies on one device: a buffer
//! per scalar column plus, for roles the kernel reads, a small int metadata
//! buffer. Sets are allocated once and reused by every later launch of the
//! same array; [`BufferRegistry`] owns them until teardown.

pub mod partition;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::array::ArrayId;
use crate::device::{BufferId, DeviceApi, KernelArg, MemFlags};
use crate::error::{Error, Result};
use crate::kernel::FunctionId;
use crate::types::{ColumnLayout, ScalarKind};

pub use partition::Partitioning;

/// Bytes of one metadata int.
pub const METADATA_INT_BYTES: usize = ScalarKind::Int.byte_size();

/// What a buffer set holds for the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferRole {
    Input,
    Output,
    /// A captured array: data plus the `{total_bytes, 0}` utility pair.
    Scope,
    /// One int the kernel sets to request deoptimization.
    DeoptFlag,
}

impl BufferRole {
    pub fn mem_flags(self) -> MemFlags {
        match self {
            BufferRole::Input | BufferRole::Scope => MemFlags::ReadOnly,
            BufferRole::Output | BufferRole::DeoptFlag => MemFlags::WriteOnly,
        }
    }

    /// Ints in the metadata buffer; write-only roles carry none.
    pub fn metadata_ints(self) -> usize {
        match self {
            BufferRole::Input => 1,
            BufferRole::Scope => 2,
            BufferRole::Output | BufferRole::DeoptFlag => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceBuffer {
    pub id: BufferId,
    pub layout: ColumnLayout,
    pub bytes: usize,
}

// ─── Buffer Set ────────────────────────────────────────────────────

#[derive(Debug)]
pub struct DeviceBufferSet {
    device_index: usize,
    role: BufferRole,
    columns: Vec<DeviceBuffer>,
    metadata: Option<DeviceBuffer>,
    elements: usize,
    allocated: bool,
}

impl DeviceBufferSet {
    pub fn new(device_index: usize, role: BufferRole) -> Self {
        Self {
            device_index,
            role,
            columns: Vec::new(),
            metadata: None,
            elements: 0,
            allocated: false,
        }
    }

    /// Allocate one buffer per column sized for `elements`, plus metadata.
    ///
    /// Returns `false` without touching the device if already allocated with
    /// the same shape. A set holding another shape is released first.
    pub fn allocate(&mut self, device: &dyn DeviceApi, layout: &[ColumnLayout], elements: usize) -> Result<bool> {
        if self.allocated {
            if self.holds(layout, elements) {
                return Ok(false);
            }
            tracing::debug!(
                device = self.device_index,
                role = ?self.role,
                from = self.elements,
                to = elements,
                "reallocating device buffers"
            );
            self.release(device);
        }
        let flags = self.role.mem_flags();
        let mut columns = Vec::with_capacity(layout.len());
        for column in layout {
            let bytes = (column.stride() * elements).max(column.stride());
            match device.create_buffer(flags, bytes) {
                Ok(id) => columns.push(DeviceBuffer {
                    id,
                    layout: *column,
                    bytes,
                }),
                Err(source) => {
                    release_all(device, &columns);
                    return Err(Error::DeviceAllocation {
                        device: self.device_index,
                        bytes,
                        source,
                    });
                }
            }
        }

        let ints = self.role.metadata_ints();
        let metadata = if ints > 0 {
            let bytes = ints * METADATA_INT_BYTES;
            let id = device.create_buffer(MemFlags::ReadOnly, bytes).map_err(|source| {
                release_all(device, &columns);
                Error::DeviceAllocation {
                    device: self.device_index,
                    bytes,
                    source,
                }
            })?;
            Some(DeviceBuffer {
                id,
                layout: ColumnLayout {
                    kind: ScalarKind::Int,
                    lanes: ints,
                },
                bytes,
            })
        } else {
            None
        };

        tracing::debug!(
            device = self.device_index,
            role = ?self.role,
            columns = columns.len(),
            elements,
            "allocated device buffers"
        );
        self.columns = columns;
        self.metadata = metadata;
        self.elements = elements;
        self.allocated = true;
        Ok(true)
    }

    pub fn release(&mut self, device: &dyn DeviceApi) {
        if !self.allocated {
            return;
        }
        release_all(device, &self.columns);
        if let Some(meta) = self.metadata.take() {
            device.release_buffer(meta.id);
        }
        self.columns.clear();
        self.elements = 0;
        self.allocated = false;
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    fn holds(&self, layout: &[ColumnLayout], elements: usize) -> bool {
        self.elements == elements && self.columns.iter().map(|c| c.layout).eq(layout.iter().copied())
    }

    pub fn device_index(&self) -> usize {
        self.device_index
    }

    pub fn role(&self) -> BufferRole {
        self.role
    }

    pub fn columns(&self) -> &[DeviceBuffer] {
        &self.columns
    }

    pub fn metadata(&self) -> Option<&DeviceBuffer> {
        self.metadata.as_ref()
    }

    /// Elements the column buffers were sized for.
    pub fn elements(&self) -> usize {
        self.elements
    }

    /// Kernel arguments in binding order: columns, then metadata.
    pub fn kernel_args(&self) -> Vec<KernelArg> {
        self.columns
            .iter()
            .chain(self.metadata.iter())
            .map(|b| KernelArg::Buffer(b.id))
            .collect()
    }
}

fn release_all(device: &dyn DeviceApi, buffers: &[DeviceBuffer]) {
    for buffer in buffers {
        device.release_buffer(buffer.id);
    }
}

// ─── Per-array Sets ────────────────────────────────────────────────

/// The buffer sets of one array across all active devices.
#[derive(Debug)]
pub struct DeviceArray {
    sets: Vec<DeviceBufferSet>,
}

impl DeviceArray {
    pub fn new(role: BufferRole, devices: usize) -> Self {
        Self {
            sets: (0..devices).map(|i| DeviceBufferSet::new(i, role)).collect(),
        }
    }

    /// Allocate on every device, sizing each set by `partitioning`.
    ///
    /// On failure every set of this array is released, so no device keeps
    /// memory for an array that is not fully allocated.
    pub fn allocate(
        &mut self,
        devices: &[Arc<dyn DeviceApi>],
        layout: &[ColumnLayout],
        partitioning: Partitioning,
        total: usize,
    ) -> Result<()> {
        for (index, (set, device)) in self.sets.iter_mut().zip(devices).enumerate() {
            if let Err(e) = set.allocate(device.as_ref(), layout, partitioning.allocation_len(total, index)) {
                self.release(devices);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn release(&mut self, devices: &[Arc<dyn DeviceApi>]) {
        for (set, device) in self.sets.iter_mut().zip(devices) {
            set.release(device.as_ref());
        }
    }

    pub fn set(&self, device: usize) -> &DeviceBufferSet {
        &self.sets[device]
    }

    pub fn sets(&self) -> &[DeviceBufferSet] {
        &self.sets
    }

    pub fn is_allocated(&self) -> bool {
        self.sets.iter().all(DeviceBufferSet::is_allocated)
    }
}

// ─── Registry ──────────────────────────────────────────────────────

/// Who a group of device buffers belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferOwner {
    Array(ArrayId),
    Function(FunctionId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub owner: BufferOwner,
    pub role: BufferRole,
    /// Distinguishes several scope arrays of one function.
    pub index: usize,
}

impl BufferKey {
    pub fn array(id: ArrayId, role: BufferRole) -> Self {
        Self {
            owner: BufferOwner::Array(id),
            role,
            index: 0,
        }
    }

    pub fn scope(function: FunctionId, index: usize) -> Self {
        Self {
            owner: BufferOwner::Function(function),
            role: BufferRole::Scope,
            index,
        }
    }

    pub fn guard(function: FunctionId) -> Self {
        Self {
            owner: BufferOwner::Function(function),
            role: BufferRole::DeoptFlag,
            index: 0,
        }
    }
}

pub type SharedDeviceArray = Arc<Mutex<DeviceArray>>;

/// Device buffers shared across calls and caller threads.
#[derive(Default)]
pub struct BufferRegistry {
    entries: Mutex<HashMap<BufferKey, SharedDeviceArray>>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sets for `key`, created unallocated on first use.
    pub fn entry(&self, key: BufferKey, devices: usize) -> SharedDeviceArray {
        let mut entries = self.entries.lock();
        Arc::clone(
            entries
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(DeviceArray::new(key.role, devices)))),
        )
    }

    pub fn get(&self, key: &BufferKey) -> Option<SharedDeviceArray> {
        self.entries.lock().get(key).cloned()
    }

    pub fn release(&self, key: &BufferKey, devices: &[Arc<dyn DeviceApi>]) {
        let removed = self.entries.lock().remove(key);
        if let Some(array) = removed {
            array.lock().release(devices);
        }
    }

    /// Free everything belonging to `owner`.
    pub fn release_owner(&self, owner: BufferOwner, devices: &[Arc<dyn DeviceApi>]) {
        let removed: Vec<SharedDeviceArray> = {
            let mut entries = self.entries.lock();
            let keys: Vec<BufferKey> = entries.keys().filter(|k| k.owner == owner).copied().collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };
        for array in removed {
            array.lock().release(devices);
        }
    }

    pub fn clear(&self, devices: &[Arc<dyn DeviceApi>]) {
        let removed: Vec<SharedDeviceArray> = self.entries.lock().drain().map(|(_, v)| v).collect();
        for array in removed {
            array.lock().release(devices);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
