//! Permanent fallback from device execution to host threads.
//!
//! When a function's device path fails in a way the runtime can recover
//! from, the function is marked deoptimized and every later call, on every
//! thread, runs the host implementation over a thread-per-chunk split.

use std::collections::HashMap;
use std::panic;
use std::thread;

use parking_lot::Mutex;

use crate::array::{Element, TypedArray};
use crate::config::RuntimeOptions;
use crate::error::{Error, Result};
use crate::kernel::FunctionId;

/// Where a function's calls run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    Device,
    Host,
}

#[derive(Default)]
pub struct DeoptController {
    table: Mutex<HashMap<FunctionId, String>>,
}

impl DeoptController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strategy(&self, function: FunctionId) -> Strategy {
        if self.is_deoptimized(function) {
            Strategy::Host
        } else {
            Strategy::Device
        }
    }

    /// Record that `function` failed with `cause`. Returns `true` the first
    /// time, when the switch is logged.
    pub fn deoptimize(&self, function: FunctionId, name: &str, cause: &Error) -> bool {
        let mut table = self.table.lock();
        if table.contains_key(&function) {
            return false;
        }
        table.insert(function, cause.to_string());
        drop(table);
        tracing::warn!(function = name, %cause, "deoptimizing to host threads");
        true
    }

    pub fn is_deoptimized(&self, function: FunctionId) -> bool {
        self.table.lock().contains_key(&function)
    }

    /// Message of the failure that deoptimized `function`.
    pub fn reason(&self, function: FunctionId) -> Option<String> {
        self.table.lock().get(&function).cloned()
    }

    pub fn reset(&self, function: FunctionId) {
        self.table.lock().remove(&function);
    }

    pub fn reset_all(&self) {
        self.table.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Worker count for host execution: the configured value, or the machine's
/// available parallelism when unset.
pub fn host_threads(options: &RuntimeOptions) -> usize {
    if options.host_threads > 0 {
        return options.host_threads;
    }
    thread::available_parallelism().map_or(1, |n| n.get())
}

/// Apply `f` to every element of `input`, writing `output`, one thread per
/// fixed chunk.
pub fn parallel_map<I, O, F>(input: &TypedArray<I>, output: &mut TypedArray<O>, threads: usize, f: &F) -> Result<()>
where
    I: Element,
    O: Element,
    F: Fn(I) -> O + Sync + ?Sized,
{
    if input.len() != output.len() {
        return Err(Error::ShapeMismatch {
            expected: input.len(),
            found: output.len(),
        });
    }
    let input = input.expanded();
    let threads = threads.clamp(1, input.len().max(1));
    let sources = input.split_in_fixed_number_of_chunks(threads)?;
    let targets = output.split_in_fixed_number_of_chunks_mut(threads)?;

    thread::scope(|s| {
        let workers: Vec<_> = sources
            .into_iter()
            .zip(targets)
            .map(|(source, mut target)| {
                s.spawn(move || {
                    for i in 0..source.len() {
                        target.set(i, f(source.get(i)));
                    }
                })
            })
            .collect();
        for worker in workers {
            if let Err(payload) = worker.join() {
                panic::resume_unwind(payload);
            }
        }
    });
    Ok(())
}
