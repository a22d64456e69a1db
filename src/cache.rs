//! Compiled kernels, one per function per device.
//!
//! Compilation runs at most once per `(function, device)`. Concurrent callers
//! asking for a kernel that is being built block until the build finishes
//! and share its result. A failed build is remembered: later callers get the
//! same error without recompiling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::device::{DeviceApi, KernelId, ProgramId};
use crate::error::{Error, Result};
use crate::kernel::{FunctionId, GeneratedKernel};

/// A kernel built for one device.
#[derive(Debug)]
pub struct CompiledKernel {
    pub program: ProgramId,
    pub kernel: KernelId,
    pub binary: Vec<u8>,
    pub entry_point: String,
    pub argument_count_hint: usize,
    launch_lock: Mutex<()>,
}

impl CompiledKernel {
    /// Build `generated` on `device` and create its kernel object.
    pub fn build(device_index: usize, device: &dyn DeviceApi, generated: &GeneratedKernel) -> Result<Self> {
        let compile_error = |e: crate::device::DeviceError| Error::KernelCompile {
            device: device_index,
            reason: e.to_string(),
        };
        let program = device.build_program(&generated.source).map_err(compile_error)?;
        let binary = device.program_binary(program).map_err(compile_error)?;
        let kernel = device
            .create_kernel(program, &generated.entry_point)
            .map_err(compile_error)?;
        tracing::debug!(
            device = device_index,
            entry = %generated.entry_point,
            binary_bytes = binary.len(),
            "built kernel"
        );
        Ok(Self {
            program,
            kernel,
            binary,
            entry_point: generated.entry_point.clone(),
            argument_count_hint: generated.argument_count_hint,
            launch_lock: Mutex::new(()),
        })
    }

    /// Held while arguments are bound and the kernel is enqueued, so that
    /// concurrent launches of the same kernel object cannot interleave.
    pub fn lock_launch(&self) -> MutexGuard<'_, ()> {
        self.launch_lock.lock()
    }
}

enum Slot {
    Building,
    Built(Arc<CompiledKernel>),
    Failed(String),
}

enum Seen {
    Ready(Arc<CompiledKernel>),
    Failed(String),
    Busy,
    Vacant,
}

type Key = (FunctionId, usize);

#[derive(Default)]
pub struct KernelCache {
    slots: Mutex<HashMap<Key, Slot>>,
    built: Condvar,
    compilations: AtomicUsize,
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The kernel of `function` on `device`, running `compile` only if no
    /// other caller has built or is building it.
    pub fn get_or_compile(
        &self,
        function: FunctionId,
        device: usize,
        compile: impl FnOnce() -> Result<CompiledKernel>,
    ) -> Result<Arc<CompiledKernel>> {
        let key = (function, device);
        {
            let mut slots = self.slots.lock();
            loop {
                let seen = match slots.get(&key) {
                    Some(Slot::Built(kernel)) => Seen::Ready(Arc::clone(kernel)),
                    Some(Slot::Failed(reason)) => Seen::Failed(reason.clone()),
                    Some(Slot::Building) => Seen::Busy,
                    None => Seen::Vacant,
                };
                match seen {
                    Seen::Ready(kernel) => return Ok(kernel),
                    Seen::Failed(reason) => return Err(Error::KernelCompile { device, reason }),
                    Seen::Busy => self.built.wait(&mut slots),
                    Seen::Vacant => {
                        slots.insert(key, Slot::Building);
                        break;
                    }
                }
            }
        }

        let mut pending = PendingBuild {
            cache: self,
            key,
            finished: false,
        };
        self.compilations.fetch_add(1, Ordering::Relaxed);
        let result = compile().map(Arc::new);
        let slot = match &result {
            Ok(kernel) => Slot::Built(Arc::clone(kernel)),
            Err(Error::KernelCompile { reason, .. }) => Slot::Failed(reason.clone()),
            Err(other) => Slot::Failed(other.to_string()),
        };
        pending.finish(slot);
        result.map_err(|e| match e {
            Error::KernelCompile { .. } => e,
            other => Error::KernelCompile {
                device,
                reason: other.to_string(),
            },
        })
    }

    /// Number of compilations started.
    pub fn compile_count(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    pub fn contains(&self, function: FunctionId, device: usize) -> bool {
        matches!(self.slots.lock().get(&(function, device)), Some(Slot::Built(_)))
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every kernel of `function`.
    pub fn evict(&self, function: FunctionId) {
        self.slots.lock().retain(|(f, _), slot| *f != function || matches!(slot, Slot::Building));
    }

    pub fn clear(&self) {
        self.slots.lock().retain(|_, slot| matches!(slot, Slot::Building));
    }
}

/// Marks the slot failed if the build unwinds before finishing.
struct PendingBuild<'a> {
    cache: &'a KernelCache,
    key: Key,
    finished: bool,
}

impl PendingBuild<'_> {
    fn finish(&mut self, slot: Slot) {
        self.cache.slots.lock().insert(self.key, slot);
        self.finished = true;
        self.cache.built.notify_all();
    }
}

impl Drop for PendingBuild<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(Slot::Failed("kernel compilation panicked".into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HostDevice, HostKernels};
    use std::sync::Barrier;
    use std::thread;

    fn generated(name: &str) -> GeneratedKernel {
        GeneratedKernel {
            source: format!("__kernel void {name}(void *a0) {{}}"),
            entry_point: name.into(),
            argument_count_hint: 1,
        }
    }

    fn device() -> HostDevice {
        let kernels = HostKernels::new();
        kernels.register("noop", |_| Ok(()));
        HostDevice::new("h0", kernels)
    }

    #[test]
    fn compiles_once_per_device() {
        let dev = device();
        let cache = KernelCache::new();
        let f = FunctionId::new();
        let a = cache
            .get_or_compile(f, 0, || CompiledKernel::build(0, &dev, &generated("noop")))
            .unwrap();
        let b = cache
            .get_or_compile(f, 0, || panic!("must not recompile"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.compile_count(), 1);
        assert!(!a.binary.is_empty());

        cache
            .get_or_compile(f, 1, || CompiledKernel::build(1, &dev, &generated("noop")))
            .unwrap();
        assert_eq!(cache.compile_count(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn concurrent_callers_share_one_build() {
        let dev = device();
        let cache = KernelCache::new();
        let f = FunctionId::new();
        let barrier = Barrier::new(8);
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    barrier.wait();
                    cache
                        .get_or_compile(f, 0, || {
                            thread::sleep(std::time::Duration::from_millis(10));
                            CompiledKernel::build(0, &dev, &generated("noop"))
                        })
                        .unwrap();
                });
            }
        });
        assert_eq!(cache.compile_count(), 1);
    }

    #[test]
    fn failure_is_terminal() {
        let dev = device();
        let cache = KernelCache::new();
        let f = FunctionId::new();
        let err = cache
            .get_or_compile(f, 0, || CompiledKernel::build(0, &dev, &generated("missing")))
            .unwrap_err();
        assert!(matches!(err, Error::KernelCompile { device: 0, .. }));
        let again = cache.get_or_compile(f, 0, || panic!("must not retry")).unwrap_err();
        assert!(matches!(again, Error::KernelCompile { .. }));
        assert_eq!(cache.compile_count(), 1);
        assert!(!cache.contains(f, 0));
    }

    #[test]
    fn panicking_build_releases_waiters() {
        let cache = KernelCache::new();
        let f = FunctionId::new();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = cache.get_or_compile(f, 0, || panic!("boom"));
        }));
        assert!(outcome.is_err());
        assert!(cache.get_or_compile(f, 0, || panic!("must not retry")).is_err());
    }

    #[test]
    fn evict_forgets_function() {
        let dev = device();
        let cache = KernelCache::new();
        let f = FunctionId::new();
        cache
            .get_or_compile(f, 0, || CompiledKernel::build(0, &dev, &generated("noop")))
            .unwrap();
        cache.evict(f);
        assert!(cache.is_empty());
    }
}
