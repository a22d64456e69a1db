//! Host-memory reference device.
//!
//! Buffers are plain byte vectors. A program's entry points are the names
//! following `__kernel void` in its source; each must be registered in the
//! shared [`HostKernels`] table, where it maps to a Rust function that runs
//! the whole launch. Operations complete synchronously, so returned events
//! are already complete.
//!
//! Faults can be injected per device to exercise error handling.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{BufferId, DeviceApi, DeviceError, Event, KernelArg, KernelId, MemFlags, ProgramId};
use crate::kernel::{GeneratedKernel, KernelShape, KernelSourceGenerator};
use crate::types::Scalar;

/// A registered kernel body. Runs once per launch over all work-items.
pub type HostKernelFn = Arc<dyn Fn(&mut HostInvocation<'_>) -> Result<(), String> + Send + Sync>;

// ─── Kernel Table ──────────────────────────────────────────────────

/// Entry-point name → host kernel, shared by every host device.
#[derive(Clone, Default)]
pub struct HostKernels {
    table: Arc<RwLock<HashMap<String, HostKernelFn>>>,
}

impl HostKernels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        kernel: impl Fn(&mut HostInvocation<'_>) -> Result<(), String> + Send + Sync + 'static,
    ) {
        self.table.write().insert(name.into(), Arc::new(kernel));
    }

    pub fn get(&self, name: &str) -> Option<HostKernelFn> {
        self.table.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.read().contains_key(name)
    }
}

/// Emits a stub `__kernel` declaration for every registered function name.
/// Sequence inputs use the variant registered as `<name>_seq`.
impl KernelSourceGenerator for HostKernels {
    fn generate(&self, shape: &KernelShape<'_>) -> Result<GeneratedKernel, String> {
        let entry_point = if shape.sequence {
            format!("{}_seq", shape.name)
        } else {
            shape.name.to_string()
        };
        if !self.contains(&entry_point) {
            return Err(format!("no host kernel registered for `{entry_point}`"));
        }
        let argument_count_hint = shape.expected_argument_count();
        let params: Vec<String> = (0..argument_count_hint).map(|i| format!("void *a{i}")).collect();
        Ok(GeneratedKernel {
            source: format!(
                "// {} -> {}\n__kernel void {}({}) {{}}\n",
                shape.input,
                shape.output,
                entry_point,
                params.join(", ")
            ),
            entry_point,
            argument_count_hint,
        })
    }
}

// ─── Invocation ────────────────────────────────────────────────────

/// Snapshot of one bound argument.
#[derive(Clone, Debug)]
pub enum HostArg {
    Buffer(Vec<u8>),
    Scalar(Vec<u8>),
}

/// Arguments and work size of a launch as seen by a host kernel.
///
/// Buffer writes are copied back to the device unless the buffer was
/// created read-only.
pub struct HostInvocation<'a> {
    global: usize,
    local: Option<usize>,
    args: &'a mut [HostArg],
}

impl HostInvocation<'_> {
    pub fn global_size(&self) -> usize {
        self.global
    }

    pub fn local_size(&self) -> Option<usize> {
        self.local
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn bytes(&self, index: usize) -> Result<&[u8], String> {
        match self.args.get(index) {
            Some(HostArg::Buffer(b)) | Some(HostArg::Scalar(b)) => Ok(b),
            None => Err(format!("argument {index} out of range")),
        }
    }

    pub fn bytes_mut(&mut self, index: usize) -> Result<&mut [u8], String> {
        match self.args.get_mut(index) {
            Some(HostArg::Buffer(b)) => Ok(b),
            Some(HostArg::Scalar(_)) => Err(format!("argument {index} is a scalar")),
            None => Err(format!("argument {index} out of range")),
        }
    }

    /// A by-value scalar argument.
    pub fn scalar<S: Scalar>(&self, index: usize) -> Result<S, String> {
        let bytes = self.bytes(index)?;
        if bytes.len() < S::KIND.byte_size() {
            return Err(format!("argument {index} is too small for {}", S::KIND));
        }
        Ok(S::load(bytes))
    }

    /// Decode a whole buffer argument.
    pub fn read<S: Scalar>(&self, index: usize) -> Result<Vec<S>, String> {
        let size = S::KIND.byte_size();
        Ok(self.bytes(index)?.chunks_exact(size).map(S::load).collect())
    }

    /// Store `value` as element `element` of a buffer argument.
    pub fn store<S: Scalar>(&mut self, index: usize, element: usize, value: S) -> Result<(), String> {
        let size = S::KIND.byte_size();
        let bytes = self.bytes_mut(index)?;
        let cell = bytes
            .get_mut(element * size..(element + 1) * size)
            .ok_or_else(|| format!("element {element} outside argument {index}"))?;
        value.store(cell);
        Ok(())
    }

    pub fn write<S: Scalar>(&mut self, index: usize, values: &[S]) -> Result<(), String> {
        for (i, v) in values.iter().enumerate() {
            self.store(index, i, *v)?;
        }
        Ok(())
    }
}

// ─── Device ────────────────────────────────────────────────────────

/// Failures to inject on the next operations of a [`HostDevice`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Faults {
    pub fail_allocation: bool,
    pub fail_build: bool,
    pub fail_write: bool,
    pub fail_launch: bool,
}

struct HostBuffer {
    flags: MemFlags,
    bytes: Vec<u8>,
}

struct HostProgram {
    source: String,
    entries: Vec<String>,
}

struct BoundKernel {
    function: HostKernelFn,
    args: BTreeMap<u32, KernelArg>,
}

#[derive(Default)]
struct HostState {
    buffers: HashMap<BufferId, HostBuffer>,
    programs: HashMap<ProgramId, HostProgram>,
    kernels: HashMap<KernelId, BoundKernel>,
    allocated: usize,
}

pub struct HostDevice {
    name: String,
    max_work_group_size: usize,
    memory_limit: Option<usize>,
    kernels: HostKernels,
    faults: Mutex<Faults>,
    state: Mutex<HostState>,
    next_handle: AtomicU64,
}

impl HostDevice {
    pub fn new(name: impl Into<String>, kernels: HostKernels) -> Self {
        Self {
            name: name.into(),
            max_work_group_size: 256,
            memory_limit: None,
            kernels,
            faults: Mutex::new(Faults::default()),
            state: Mutex::new(HostState::default()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn with_max_work_group_size(mut self, size: usize) -> Self {
        self.max_work_group_size = size.max(1);
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn set_faults(&self, faults: Faults) {
        *self.faults.lock() = faults;
    }

    pub fn faults(&self) -> Faults {
        *self.faults.lock()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.state.lock().allocated
    }

    /// Copy of a buffer's current contents.
    pub fn buffer_contents(&self, buffer: BufferId) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer).map(|b| b.bytes.clone())
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

/// Names following `__kernel void` in `source`.
fn kernel_entries(source: &str) -> Vec<String> {
    source
        .match_indices("__kernel")
        .filter_map(|(pos, keyword)| {
            let rest = source[pos + keyword.len()..].trim_start();
            let rest = rest.strip_prefix("void")?.trim_start();
            let end = rest.find(|c: char| !(c.is_alphanumeric() || c == '_'))?;
            (end > 0).then(|| rest[..end].to_string())
        })
        .collect()
}

fn check_range(offset: usize, len: usize, size: usize) -> Result<(), DeviceError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(DeviceError::OutOfBounds { offset, len, size }),
    }
}

impl DeviceApi for HostDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_work_group_size(&self) -> usize {
        self.max_work_group_size
    }

    fn create_buffer(&self, flags: MemFlags, size: usize) -> Result<BufferId, DeviceError> {
        let mut state = self.state.lock();
        let over_limit = self
            .memory_limit
            .is_some_and(|limit| state.allocated + size > limit);
        if self.faults().fail_allocation || over_limit {
            return Err(DeviceError::OutOfMemory { requested: size });
        }
        let id = BufferId(self.handle());
        state.buffers.insert(
            id,
            HostBuffer {
                flags,
                bytes: vec![0; size],
            },
        );
        state.allocated += size;
        Ok(id)
    }

    fn release_buffer(&self, buffer: BufferId) {
        let mut state = self.state.lock();
        if let Some(buf) = state.buffers.remove(&buffer) {
            state.allocated -= buf.bytes.len();
        }
    }

    fn enqueue_write(&self, buffer: BufferId, offset: usize, data: &[u8]) -> Result<Event, DeviceError> {
        if self.faults().fail_write {
            return Err(DeviceError::Execution("injected write failure".into()));
        }
        let mut state = self.state.lock();
        let buf = state
            .buffers
            .get_mut(&buffer)
            .ok_or(DeviceError::InvalidBuffer(buffer))?;
        check_range(offset, data.len(), buf.bytes.len())?;
        buf.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(Event::completed(None))
    }

    fn enqueue_read(&self, buffer: BufferId, offset: usize, size: usize) -> Result<Event, DeviceError> {
        let state = self.state.lock();
        let buf = state
            .buffers
            .get(&buffer)
            .ok_or(DeviceError::InvalidBuffer(buffer))?;
        check_range(offset, size, buf.bytes.len())?;
        Ok(Event::completed(Some(buf.bytes[offset..offset + size].to_vec())))
    }

    fn build_program(&self, source: &str) -> Result<ProgramId, DeviceError> {
        if self.faults().fail_build {
            return Err(DeviceError::Build("injected build failure".into()));
        }
        let entries = kernel_entries(source);
        if entries.is_empty() {
            return Err(DeviceError::Build("no __kernel entry point".into()));
        }
        if let Some(missing) = entries.iter().find(|e| !self.kernels.contains(e)) {
            return Err(DeviceError::Build(format!("undefined kernel `{missing}`")));
        }
        let id = ProgramId(self.handle());
        self.state.lock().programs.insert(
            id,
            HostProgram {
                source: source.to_string(),
                entries,
            },
        );
        Ok(id)
    }

    fn program_binary(&self, program: ProgramId) -> Result<Vec<u8>, DeviceError> {
        let state = self.state.lock();
        let program = state.programs.get(&program).ok_or(DeviceError::InvalidHandle)?;
        Ok(program.source.as_bytes().to_vec())
    }

    fn create_kernel(&self, program: ProgramId, entry_point: &str) -> Result<KernelId, DeviceError> {
        let mut state = self.state.lock();
        let program = state.programs.get(&program).ok_or(DeviceError::InvalidHandle)?;
        if !program.entries.iter().any(|e| e == entry_point) {
            return Err(DeviceError::MissingKernel(entry_point.to_string()));
        }
        let function = self
            .kernels
            .get(entry_point)
            .ok_or_else(|| DeviceError::MissingKernel(entry_point.to_string()))?;
        let id = KernelId(self.handle());
        state.kernels.insert(
            id,
            BoundKernel {
                function,
                args: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: KernelArg) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if let KernelArg::Buffer(id) = &arg {
            if !state.buffers.contains_key(id) {
                return Err(DeviceError::InvalidBuffer(*id));
            }
        }
        let bound = state.kernels.get_mut(&kernel).ok_or(DeviceError::InvalidHandle)?;
        bound.args.insert(index, arg);
        Ok(())
    }

    fn enqueue_kernel(&self, kernel: KernelId, global: usize, local: Option<usize>) -> Result<Event, DeviceError> {
        if self.faults().fail_launch {
            return Err(DeviceError::Execution("injected launch failure".into()));
        }
        if let Some(local) = local {
            if local == 0 || local > self.max_work_group_size || global % local != 0 {
                return Err(DeviceError::InvalidWorkSize { global, local });
            }
        }

        let (function, mut args, targets) = {
            let state = self.state.lock();
            let bound = state.kernels.get(&kernel).ok_or(DeviceError::InvalidHandle)?;
            let count = bound.args.keys().next_back().map_or(0, |last| last + 1);
            let mut args = Vec::with_capacity(count as usize);
            let mut targets = Vec::with_capacity(count as usize);
            for index in 0..count {
                match bound.args.get(&index) {
                    None => return Err(DeviceError::UnsetArgument(index)),
                    Some(KernelArg::Buffer(id)) => {
                        let buf = state.buffers.get(id).ok_or(DeviceError::InvalidBuffer(*id))?;
                        args.push(HostArg::Buffer(buf.bytes.clone()));
                        targets.push((buf.flags != MemFlags::ReadOnly).then_some(*id));
                    }
                    Some(KernelArg::Scalar(bytes)) => {
                        args.push(HostArg::Scalar(bytes.clone()));
                        targets.push(None);
                    }
                }
            }
            (Arc::clone(&bound.function), args, targets)
        };

        {
            let mut invocation = HostInvocation {
                global,
                local,
                args: &mut args,
            };
            function(&mut invocation).map_err(DeviceError::Execution)?;
        }

        let mut state = self.state.lock();
        for (arg, target) in args.into_iter().zip(targets) {
            if let (HostArg::Buffer(bytes), Some(id)) = (arg, target) {
                if let Some(buf) = state.buffers.get_mut(&id) {
                    buf.bytes = bytes;
                }
            }
        }
        Ok(Event::completed(None))
    }
}
