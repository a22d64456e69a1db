//! Process-wide runtime state shared by every array function.
//!
//! A [`RuntimeContext`] owns the active devices, the kernel source
//! generator, and the caches that live across calls: compiled kernels, device
//! buffers, type descriptors and the deoptimization table. Dropping it
//! releases every device buffer it still holds.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::array::{ArrayId, Element};
use crate::buffers::{BufferOwner, BufferRegistry};
use crate::cache::KernelCache;
use crate::config::RuntimeOptions;
use crate::deopt::{self, DeoptController};
use crate::device::{DeviceApi, HostDevice, HostKernels, WgpuDevice};
use crate::kernel::{FunctionId, KernelSourceGenerator, SourceTable};
use crate::profiler::{Profiler, TimestampSink};
use crate::types::{TypeCache, TypeDescriptor};

pub struct RuntimeContext {
    devices: Vec<Arc<dyn DeviceApi>>,
    generator: Arc<dyn KernelSourceGenerator>,
    options: RuntimeOptions,
    kernels: KernelCache,
    buffers: BufferRegistry,
    types: TypeCache,
    deopt: DeoptController,
    profiler: Arc<Profiler>,
    functions: Mutex<HashMap<String, FunctionId>>,
}

impl RuntimeContext {
    pub fn new(
        devices: Vec<Arc<dyn DeviceApi>>,
        generator: Arc<dyn KernelSourceGenerator>,
        options: RuntimeOptions,
    ) -> Self {
        let profiler = Arc::new(Profiler::new(options.profile));
        tracing::info!(
            devices = devices.len(),
            multi_device = options.multi_device,
            guards = options.deopt_guards,
            "runtime ready"
        );
        Self {
            devices,
            generator,
            options,
            kernels: KernelCache::new(),
            buffers: BufferRegistry::new(),
            types: TypeCache::new(),
            deopt: DeoptController::new(),
            profiler,
            functions: Mutex::new(HashMap::new()),
        }
    }

    /// `count` host reference devices sharing one kernel table, which also
    /// serves as the source generator.
    pub fn host(count: usize, kernels: HostKernels, options: RuntimeOptions) -> Self {
        let devices = (0..count)
            .map(|i| Arc::new(HostDevice::new(format!("host:{i}"), kernels.clone())) as Arc<dyn DeviceApi>)
            .collect();
        Self::new(devices, Arc::new(kernels), options)
    }

    /// The first wgpu adapter, with WGSL sources from `table`. `None` when
    /// no adapter is available.
    pub fn gpu(table: Arc<SourceTable>, options: RuntimeOptions) -> Option<Self> {
        let device = WgpuDevice::try_new()?;
        Some(Self::new(vec![Arc::new(device)], table, options))
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn devices(&self) -> &[Arc<dyn DeviceApi>] {
        &self.devices
    }

    /// Devices a map is spread over.
    pub fn active_devices(&self) -> &[Arc<dyn DeviceApi>] {
        if self.options.multi_device {
            &self.devices
        } else {
            &self.devices[..self.devices.len().min(1)]
        }
    }

    pub fn generator(&self) -> &dyn KernelSourceGenerator {
        self.generator.as_ref()
    }

    pub fn kernels(&self) -> &KernelCache {
        &self.kernels
    }

    pub fn buffers(&self) -> &BufferRegistry {
        &self.buffers
    }

    pub fn deopt(&self) -> &DeoptController {
        &self.deopt
    }

    pub fn profiler(&self) -> &Arc<Profiler> {
        &self.profiler
    }

    pub fn sink(&self) -> Arc<dyn TimestampSink> {
        self.profiler.clone()
    }

    pub fn host_threads(&self) -> usize {
        deopt::host_threads(&self.options)
    }

    pub fn descriptor_of<T: Element>(&self) -> Arc<TypeDescriptor> {
        self.types.descriptor_of::<T>()
    }

    pub fn cached_types(&self) -> usize {
        self.types.len()
    }

    /// Stable identity for the function called `name`.
    pub fn function_id(&self, name: &str) -> FunctionId {
        *self.functions.lock().entry(name.to_string()).or_default()
    }

    /// Free the device buffers held for `array`.
    pub fn release_array(&self, array: ArrayId) {
        self.buffers.release_owner(BufferOwner::Array(array), &self.devices);
    }

    /// Free the device buffers and kernels held for `function`.
    pub fn release_function(&self, function: FunctionId) {
        self.buffers.release_owner(BufferOwner::Function(function), &self.devices);
        self.kernels.evict(function);
    }

    /// Drop every cache, releasing all device buffers.
    pub fn clear(&self) {
        self.buffers.clear(&self.devices);
        self.kernels.clear();
        self.deopt.reset_all();
        self.types.clear();
        self.profiler.clear();
    }
}

impl Drop for RuntimeContext {
    fn drop(&mut self) {
        self.buffers.clear(&self.devices);
    }
}
