//! Element-wise map offloaded to the runtime's devices.
//!
//! One call runs four phases, each timed into the profiler:
//!
//! 1. prepare: generate and build the kernel per device, allocate buffers
//! 2. copy the input, captured arrays and guard to every device
//! 3. bind arguments and launch each device's share
//! 4. read every share back into a fresh output array
//!
//! A failure that [`Error::triggers_deopt`] marks the function deoptimized
//! and the call, like every later one, completes on host threads.
//! Allocation failures are returned to the caller.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use crate::array::{ArrayId, Element, TypedArray};
use crate::buffers::{BufferKey, BufferOwner, BufferRole, DeviceArray, Partitioning, SharedDeviceArray};
use crate::cache::CompiledKernel;
use crate::deopt::{self, Strategy};
use crate::device::{DeviceApi, Event};
use crate::error::{Error, Result};
use crate::exec::ArrayFunction;
use crate::kernel::{Captures, FunctionId, GeneratedKernel, KernelShape, ScopeVariable};
use crate::launch::{argument_layout, ArgSource, Bindings, DeviceLaunch};
use crate::marshal;
use crate::profiler::{ProfileEvent, ProfileKind, TimestampSink};
use crate::runtime::RuntimeContext;
use crate::types::{ColumnLayout, ScalarKind};

pub struct MapAccelerator<I, O, F> {
    ctx: Arc<RuntimeContext>,
    id: FunctionId,
    name: String,
    captures: Captures,
    f: F,
    generated: HashMap<FunctionId, GeneratedKernel>,
    last_input: Option<ArrayId>,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O, F> MapAccelerator<I, O, F>
where
    I: Element,
    O: Element,
    F: Fn(I) -> O + Send + Sync,
{
    /// `f` is the host implementation, used after deoptimization. The
    /// device kernel comes from the runtime's generator under `name`.
    pub fn new(ctx: Arc<RuntimeContext>, name: &str, captures: Captures, f: F) -> Self {
        let id = ctx.function_id(name);
        Self {
            ctx,
            id,
            name: name.to_string(),
            captures,
            f,
            generated: HashMap::new(),
            last_input: None,
            _types: PhantomData,
        }
    }

    pub fn id(&self) -> FunctionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> Strategy {
        self.ctx.deopt().strategy(self.id)
    }

    fn run_host(&self, input: &TypedArray<I>) -> Result<TypedArray<O>> {
        let mut output = TypedArray::new(input.len());
        deopt::parallel_map(input, &mut output, self.ctx.host_threads(), &self.f)?;
        Ok(output)
    }

    fn record_phase(&self, kind: ProfileKind, started: Instant) {
        self.ctx.profiler().record(ProfileEvent {
            kind,
            device: None,
            duration: started.elapsed(),
        });
    }

    /// Kernel identity for this input shape; sequences build their own.
    fn kernel_id(&self, sequence: bool) -> FunctionId {
        if sequence {
            self.ctx.function_id(&format!("{}_seq", self.name))
        } else {
            self.id
        }
    }

    fn generate(&mut self, kernel_id: FunctionId, sequence: bool) -> Result<GeneratedKernel> {
        if let Some(generated) = self.generated.get(&kernel_id) {
            return Ok(generated.clone());
        }
        let input = self.ctx.descriptor_of::<I>();
        let output = self.ctx.descriptor_of::<O>();
        let shape = KernelShape {
            function: kernel_id,
            name: &self.name,
            input: &input,
            output: &output,
            scope: &self.captures,
            sequence,
        };
        let generated = self
            .ctx
            .generator()
            .generate(&shape)
            .map_err(|reason| Error::KernelGeneration {
                function: self.name.clone(),
                reason,
            })?;
        if self.ctx.options().print_kernel_info {
            tracing::info!(function = %self.name, entry = %generated.entry_point, source = %generated.source, "generated kernel");
        }
        self.generated.insert(kernel_id, generated.clone());
        Ok(generated)
    }

    /// Device buffers for this call's output, reallocated when the input
    /// length changes.
    /// Output sets are shared by every handle of this function and resized
    /// by `allocate` when the input length changes.
    fn output_sets(&self, devices: usize) -> SharedDeviceArray {
        let key = BufferKey {
            owner: BufferOwner::Function(self.id),
            role: BufferRole::Output,
            index: 0,
        };
        self.ctx.buffers().entry(key, devices)
    }

    fn track_input(&mut self, input: ArrayId) {
        if let Some(previous) = self.last_input.replace(input) {
            if previous != input {
                self.ctx.release_array(previous);
            }
        }
    }

    fn run_device(&mut self, input: &TypedArray<I>) -> Result<TypedArray<O>> {
        let ctx = Arc::clone(&self.ctx);
        let devices = ctx.active_devices();
        if devices.is_empty() {
            return Err(Error::NoDevices);
        }
        let sink = ctx.sink();
        let total = input.len();
        let partitioning = Partitioning::for_devices(devices.len());
        let guarded = ctx.options().deopt_guards;

        // ─── prepare ───
        let started = Instant::now();
        let sequence = input.is_sequence();
        let kernel_id = self.kernel_id(sequence);
        let generated = self.generate(kernel_id, sequence)?;
        let kernels = devices
            .iter()
            .enumerate()
            .map(|(index, device)| {
                ctx.kernels().get_or_compile(kernel_id, index, || {
                    CompiledKernel::build(index, device.as_ref(), &generated)
                })
            })
            .collect::<Result<Vec<Arc<CompiledKernel>>>>()?;

        let layout = argument_layout(input.layout().len(), &self.captures, O::layout().len(), guarded)?;
        let declared = layout.iter().filter(|s| **s != ArgSource::DeoptGuard).count();
        if declared != generated.argument_count_hint {
            tracing::warn!(
                function = %self.name,
                declared,
                hint = generated.argument_count_hint,
                "kernel parameter count differs from bound arguments"
            );
        }

        self.track_input(input.id());
        let input_array = ctx
            .buffers()
            .entry(BufferKey::array(input.id(), BufferRole::Input), devices.len());
        let mut input_sets = input_array.lock();
        if sequence {
            input_sets.allocate(devices, input.layout(), Partitioning::Replicated, input.stored_len())?;
        } else {
            input_sets.allocate(devices, input.layout(), partitioning, total)?;
        }

        let scope_arrays: Vec<SharedDeviceArray> = self
            .captures
            .iter()
            .filter(|var| var.is_array())
            .enumerate()
            .map(|(n, _)| ctx.buffers().entry(BufferKey::scope(self.id, n), devices.len()))
            .collect();
        let mut scope_sets: Vec<_> = scope_arrays.iter().map(|a| a.lock()).collect();
        for (sets, var) in scope_sets
            .iter_mut()
            .zip(self.captures.iter().filter(|var| var.is_array()))
        {
            if let ScopeVariable::ArrayLike { kind, staged, .. } = var {
                let elements = staged.len() / kind.byte_size();
                sets.allocate(devices, &[ColumnLayout::scalar(*kind)], Partitioning::Replicated, elements)?;
            }
        }

        let output_array = self.output_sets(devices.len());
        let mut output_sets = output_array.lock();
        output_sets.allocate(devices, &O::layout(), partitioning, total)?;

        let guard_array = guarded.then(|| ctx.buffers().entry(BufferKey::guard(self.id), devices.len()));
        let mut guard_sets = guard_array.as_ref().map(|a| a.lock());
        if let Some(sets) = guard_sets.as_mut() {
            sets.allocate(devices, &[ColumnLayout::scalar(ScalarKind::Int)], Partitioning::Replicated, 1)?;
        }
        self.record_phase(ProfileKind::ComputeMapPrepare, started);

        // ─── copy in ───
        let started = Instant::now();
        let mut pending = marshal::copy_in_all(devices, input, &input_sets, partitioning, &sink)?;
        for (index, (device, events)) in devices.iter().zip(pending.iter_mut()).enumerate() {
            for (sets, var) in scope_sets
                .iter()
                .zip(self.captures.iter().filter(|var| var.is_array()))
            {
                events.extend(marshal::upload_scope(device.as_ref(), var, sets.set(index), &sink)?);
            }
            if let Some(sets) = guard_sets.as_ref() {
                events.push(reset_guard(device.as_ref(), sets, index)?);
            }
        }
        self.record_phase(ProfileKind::CopyToDevice, started);

        // ─── launch ───
        let started = Instant::now();
        let mut launched = Vec::with_capacity(devices.len());
        for (index, (device, kernel)) in devices.iter().zip(&kernels).enumerate() {
            let args = Bindings {
                input: input_sets.set(index),
                scope: &self.captures,
                scope_arrays: scope_sets.iter().map(|sets| sets.set(index)).collect(),
                output: output_sets.set(index),
                guard: guard_sets.as_ref().map(|sets| sets.set(index)),
            }
            .resolve(&layout)?;
            let launch = DeviceLaunch {
                device_index: index,
                device: device.as_ref(),
                kernel,
                args,
                work_items: partitioning.transfer_span(total, index).len,
            };
            if let Some(event) = launch.enqueue(&pending[index], &sink)? {
                launched.push((index, event));
            }
        }
        for (index, event) in &launched {
            event
                .wait()
                .map_err(Error::enqueue(*index, "kernel execution"))?;
        }
        self.record_phase(ProfileKind::ComputeMap, started);

        // ─── copy out ───
        let started = Instant::now();
        let mut output = TypedArray::<O>::new(total);
        marshal::copy_out_all(devices, &mut output, &output_sets, partitioning, &sink)?;
        if let Some(sets) = guard_sets.as_ref() {
            check_guards(devices, sets)?;
        }
        self.record_phase(ProfileKind::CopyToHost, started);
        Ok(output)
    }
}

fn reset_guard(device: &dyn DeviceApi, sets: &DeviceArray, index: usize) -> Result<Event> {
    let column = sets.set(index).columns()[0].id;
    device
        .enqueue_write(column, 0, &0i32.to_le_bytes())
        .map_err(Error::enqueue(index, "write guard"))
}

/// Fail with [`Error::DeoptGuard`] if any device raised its guard.
fn check_guards(devices: &[Arc<dyn DeviceApi>], sets: &DeviceArray) -> Result<()> {
    let reads = devices
        .iter()
        .enumerate()
        .map(|(index, device)| {
            let column = sets.set(index).columns()[0].id;
            device
                .enqueue_read(column, 0, 4)
                .map_err(Error::enqueue(index, "read guard"))
        })
        .collect::<Result<Vec<Event>>>()?;
    for (device, read) in reads.iter().enumerate() {
        read.wait().map_err(Error::enqueue(device, "read guard"))?;
        let raised = read
            .take_payload()
            .and_then(|bytes| bytes.get(..4).map(|b| i32::from_le(bytemuck::pod_read_unaligned(b))))
            .is_some_and(|flag| flag != 0);
        if raised {
            return Err(Error::DeoptGuard { device });
        }
    }
    Ok(())
}

impl<I, O, F> ArrayFunction<I, O> for MapAccelerator<I, O, F>
where
    I: Element,
    O: Element,
    F: Fn(I) -> O + Send + Sync,
{
    fn apply(&mut self, input: &TypedArray<I>) -> Result<TypedArray<O>> {
        if self.strategy() == Strategy::Host {
            return self.run_host(input);
        }
        match self.run_device(input) {
            Ok(output) => Ok(output),
            Err(cause) if cause.triggers_deopt() && self.ctx.options().deoptimize => {
                let first = self.ctx.deopt().deoptimize(self.id, &self.name, &cause);
                let started = Instant::now();
                let output = self.run_host(input);
                if first {
                    self.record_phase(ProfileKind::Deopt, started);
                }
                output
            }
            Err(cause) => Err(cause),
        }
    }
}

impl<I, O, F> Drop for MapAccelerator<I, O, F> {
    fn drop(&mut self) {
        let devices = self.ctx.devices();
        self.ctx
            .buffers()
            .release_owner(BufferOwner::Function(self.id), devices);
        if let Some(input) = self.last_input.take() {
            self.ctx.release_array(input);
        }
    }
}
