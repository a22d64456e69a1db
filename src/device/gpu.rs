//! wgpu compute backend.
//!
//! Programs are WGSL modules; a kernel's argument index is its binding
//! number in bind group 0. By-value scalars are uploaded into small storage
//! buffers. The work-group size is fixed by the shader's `@workgroup_size`
//! (see [`WORKGROUP_SIZE`]), so the requested local size is ignored.
//!
//! Every operation is submitted and waited on before returning; events come
//! back already complete.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use super::{BufferId, DeviceApi, DeviceError, Event, KernelArg, KernelId, MemFlags, ProgramId};

/// Work-group size assumed by bundled and generated WGSL kernels.
pub const WORKGROUP_SIZE: usize = 64;

struct GpuBuffer {
    buffer: wgpu::Buffer,
    size: usize,
}

struct GpuProgram {
    module: wgpu::ShaderModule,
    source: String,
}

enum GpuArg {
    Buffer(BufferId),
    Scalar(wgpu::Buffer),
}

struct GpuKernel {
    pipeline: wgpu::ComputePipeline,
    args: BTreeMap<u32, GpuArg>,
}

#[derive(Default)]
struct GpuState {
    buffers: HashMap<BufferId, GpuBuffer>,
    programs: HashMap<ProgramId, GpuProgram>,
    kernels: HashMap<KernelId, GpuKernel>,
}

pub struct WgpuDevice {
    name: String,
    device: wgpu::Device,
    queue: wgpu::Queue,
    state: Mutex<GpuState>,
    next_handle: AtomicU64,
}

/// Round up to the copy alignment wgpu requires.
fn aligned(size: usize) -> usize {
    size.max(4).div_ceil(4) * 4
}

impl WgpuDevice {
    /// Open the first high-performance adapter. `None` if no GPU is present.
    pub fn try_new() -> Option<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))?;
        let name = adapter.get_info().name;
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("hetarray-gpu"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .ok()?;
        tracing::info!(adapter = %name, "opened wgpu device");
        Some(Self {
            name,
            device,
            queue,
            state: Mutex::new(GpuState::default()),
            next_handle: AtomicU64::new(1),
        })
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Run `f` inside out-of-memory and validation error scopes.
    fn validated<T>(&self, f: impl FnOnce() -> T, err: impl FnOnce(String) -> DeviceError) -> Result<T, DeviceError> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        match out_of_memory.or(validation) {
            Some(e) => Err(err(e.to_string())),
            None => Ok(value),
        }
    }
}

impl DeviceApi for WgpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_work_group_size(&self) -> usize {
        self.device.limits().max_compute_invocations_per_workgroup as usize
    }

    fn create_buffer(&self, _flags: MemFlags, size: usize) -> Result<BufferId, DeviceError> {
        let buffer = self.validated(
            || {
                self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("hetarray-buffer"),
                    size: aligned(size) as u64,
                    usage: wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::COPY_DST
                        | wgpu::BufferUsages::COPY_SRC,
                    mapped_at_creation: false,
                })
            },
            |_| DeviceError::OutOfMemory { requested: size },
        )?;
        let id = BufferId(self.handle());
        self.state.lock().buffers.insert(id, GpuBuffer { buffer, size });
        Ok(id)
    }

    fn release_buffer(&self, buffer: BufferId) {
        if let Some(buf) = self.state.lock().buffers.remove(&buffer) {
            buf.buffer.destroy();
        }
    }

    fn enqueue_write(&self, buffer: BufferId, offset: usize, data: &[u8]) -> Result<Event, DeviceError> {
        let state = self.state.lock();
        let buf = state.buffers.get(&buffer).ok_or(DeviceError::InvalidBuffer(buffer))?;
        if offset % 4 != 0 || offset + data.len() > buf.size {
            return Err(DeviceError::OutOfBounds {
                offset,
                len: data.len(),
                size: buf.size,
            });
        }
        if data.is_empty() {
            return Ok(Event::completed(None));
        }
        let mut padded = data.to_vec();
        padded.resize(aligned(data.len()), 0);
        self.queue.write_buffer(&buf.buffer, offset as u64, &padded);
        self.queue.submit(std::iter::empty());
        self.device.poll(wgpu::Maintain::Wait);
        Ok(Event::completed(None))
    }

    fn enqueue_read(&self, buffer: BufferId, offset: usize, size: usize) -> Result<Event, DeviceError> {
        let state = self.state.lock();
        let buf = state.buffers.get(&buffer).ok_or(DeviceError::InvalidBuffer(buffer))?;
        if offset % 4 != 0 || offset + size > buf.size {
            return Err(DeviceError::OutOfBounds {
                offset,
                len: size,
                size: buf.size,
            });
        }
        if size == 0 {
            return Ok(Event::completed(Some(Vec::new())));
        }
        let span = aligned(size) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("hetarray-staging"),
            size: span,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("hetarray-read"),
        });
        encoder.copy_buffer_to_buffer(&buf.buffer, offset as u64, &staging, 0, span);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..span);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| DeviceError::Backend("readback channel closed".into()))?
            .map_err(|e| DeviceError::Backend(format!("readback failed: {e}")))?;

        let bytes = slice.get_mapped_range()[..size].to_vec();
        staging.unmap();
        Ok(Event::completed(Some(bytes)))
    }

    fn build_program(&self, source: &str) -> Result<ProgramId, DeviceError> {
        let module = self.validated(
            || {
                self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("hetarray-program"),
                    source: wgpu::ShaderSource::Wgsl(source.into()),
                })
            },
            DeviceError::Build,
        )?;
        let id = ProgramId(self.handle());
        self.state.lock().programs.insert(
            id,
            GpuProgram {
                module,
                source: source.to_string(),
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
        let pipeline = self.validated(
            || {
                self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(entry_point),
                    layout: None,
                    module: &program.module,
                    entry_point: Some(entry_point),
                    compilation_options: Default::default(),
                    cache: None,
                })
            },
            |reason| DeviceError::Build(format!("`{entry_point}`: {reason}")),
        )?;
        let id = KernelId(self.handle());
        state.kernels.insert(
            id,
            GpuKernel {
                pipeline,
                args: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: KernelArg) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let arg = match arg {
            KernelArg::Buffer(id) => {
                if !state.buffers.contains_key(&id) {
                    return Err(DeviceError::InvalidBuffer(id));
                }
                GpuArg::Buffer(id)
            }
            KernelArg::Scalar(bytes) => {
                let mut padded = bytes;
                padded.resize(aligned(padded.len()), 0);
                GpuArg::Scalar(self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("hetarray-scalar"),
                    contents: &padded,
                    usage: wgpu::BufferUsages::STORAGE,
                }))
            }
        };
        let bound = state.kernels.get_mut(&kernel).ok_or(DeviceError::InvalidHandle)?;
        bound.args.insert(index, arg);
        Ok(())
    }

    fn enqueue_kernel(&self, kernel: KernelId, global: usize, _local: Option<usize>) -> Result<Event, DeviceError> {
        let state = self.state.lock();
        let bound = state.kernels.get(&kernel).ok_or(DeviceError::InvalidHandle)?;

        let mut entries = Vec::with_capacity(bound.args.len());
        for (expected, (index, arg)) in bound.args.iter().enumerate() {
            if *index != expected as u32 {
                return Err(DeviceError::UnsetArgument(expected as u32));
            }
            let buffer = match arg {
                GpuArg::Buffer(id) => &state.buffers.get(id).ok_or(DeviceError::InvalidBuffer(*id))?.buffer,
                GpuArg::Scalar(buffer) => buffer,
            };
            entries.push(wgpu::BindGroupEntry {
                binding: *index,
                resource: buffer.as_entire_binding(),
            });
        }

        let layout = bound.pipeline.get_bind_group_layout(0);
        let bind_group = self.validated(
            || {
                self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("hetarray-args"),
                    layout: &layout,
                    entries: &entries,
                })
            },
            DeviceError::Execution,
        )?;

        let workgroups = global.div_ceil(WORKGROUP_SIZE) as u32;
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("hetarray-launch"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("hetarray-pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&bound.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(workgroups, 1, 1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        self.device.poll(wgpu::Maintain::Wait);
        Ok(Event::completed(None))
    }
}
