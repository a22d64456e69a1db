//! Kernel parameter order.
//!
//! A kernel declares, in order: one parameter per input column, the input
//! length, the captured scope, one parameter per output column and, when
//! guards are enabled, the deoptimization flag.
//!
//! Scope positions follow the declared slots: position `i` holds the scalar
//! captured at slot `i`, or, if that slot is an array, the next captured
//! array's data buffer followed by its `{total_bytes, 0}` utility buffer.
//! Every array shifts the positions after it by one.

use crate::buffers::DeviceBufferSet;
use crate::device::KernelArg;
use crate::error::{Error, Result};
use crate::kernel::{Captures, ScopeVariable};

/// Where one kernel parameter comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgSource {
    InputColumn(usize),
    InputLength,
    /// Scalar captured at this slot.
    ScopeScalar(usize),
    /// Data buffer of the n-th captured array.
    ScopeArray(usize),
    /// Utility buffer of the n-th captured array.
    ScopeArrayUtility(usize),
    OutputColumn(usize),
    DeoptGuard,
}

/// Parameter sources in binding order.
pub fn argument_layout(
    input_columns: usize,
    scope: &Captures,
    output_columns: usize,
    guard: bool,
) -> Result<Vec<ArgSource>> {
    scope.validate()?;
    let mut by_slot: Vec<Option<&ScopeVariable>> = vec![None; scope.len()];
    for var in scope.iter() {
        by_slot[var.slot()] = Some(var);
    }

    let mut layout: Vec<ArgSource> = (0..input_columns).map(ArgSource::InputColumn).collect();
    layout.push(ArgSource::InputLength);

    let mut next_array = 0;
    for (slot, var) in by_slot.into_iter().enumerate() {
        match var {
            Some(var) if var.is_array() => {
                layout.push(ArgSource::ScopeArray(next_array));
                layout.push(ArgSource::ScopeArrayUtility(next_array));
                next_array += 1;
            }
            Some(_) => layout.push(ArgSource::ScopeScalar(slot)),
            None => return Err(Error::InvalidScope(format!("slot {slot} is empty"))),
        }
    }

    layout.extend((0..output_columns).map(ArgSource::OutputColumn));
    if guard {
        layout.push(ArgSource::DeoptGuard);
    }
    Ok(layout)
}

/// The buffer sets one device binds.
pub struct Bindings<'a> {
    pub input: &'a DeviceBufferSet,
    pub scope: &'a Captures,
    /// One set per captured array, in capture order.
    pub scope_arrays: Vec<&'a DeviceBufferSet>,
    pub output: &'a DeviceBufferSet,
    pub guard: Option<&'a DeviceBufferSet>,
}

impl Bindings<'_> {
    /// Resolve `layout` into concrete kernel arguments.
    pub fn resolve(&self, layout: &[ArgSource]) -> Result<Vec<KernelArg>> {
        layout.iter().map(|source| self.arg(*source)).collect()
    }

    fn arg(&self, source: ArgSource) -> Result<KernelArg> {
        let missing = |what: String| Error::InvalidScope(format!("no buffer bound for {what}"));
        let buffer = match source {
            ArgSource::InputColumn(i) => self.input.columns().get(i).map(|b| b.id),
            ArgSource::InputLength => self.input.metadata().map(|b| b.id),
            ArgSource::ScopeScalar(slot) => {
                let value = self.scope.iter().find_map(|var| match var {
                    ScopeVariable::Scalar { value, slot: s, .. } if *s == slot => Some(value.to_bytes()),
                    _ => None,
                });
                return value
                    .map(KernelArg::Scalar)
                    .ok_or_else(|| missing(format!("scope slot {slot}")));
            }
            ArgSource::ScopeArray(n) => self
                .scope_arrays
                .get(n)
                .and_then(|set| set.columns().first())
                .map(|b| b.id),
            ArgSource::ScopeArrayUtility(n) => self
                .scope_arrays
                .get(n)
                .and_then(|set| set.metadata())
                .map(|b| b.id),
            ArgSource::OutputColumn(i) => self.output.columns().get(i).map(|b| b.id),
            ArgSource::DeoptGuard => self.guard.and_then(|set| set.columns().first()).map(|b| b.id),
        };
        buffer
            .map(KernelArg::Buffer)
            .ok_or_else(|| missing(format!("{source:?}")))
    }
}
