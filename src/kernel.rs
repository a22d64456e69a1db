//! Function identity, captured scope and kernel source generation.
//!
//! Turning a host function into device source is delegated to a
//! [`KernelSourceGenerator`]. The runtime hands it a [`KernelShape`] and gets
//! back source text, an entry point and the number of parameters the kernel
//! declares.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{Scalar, ScalarKind, ScalarValue, TypeDescriptor};

/// Stable identity of a user function; keys the kernel cache and the
/// deoptimization table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FunctionId(Uuid);

impl FunctionId {
    pub fn new() -> Self {
        FunctionId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FunctionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Captured Scope ────────────────────────────────────────────────

/// A value the function reads from its enclosing scope.
///
/// `slot` is the variable's position in the function's capture list.
#[derive(Clone, Debug, PartialEq)]
pub enum ScopeVariable {
    /// Passed to the kernel by value.
    Scalar {
        value: ScalarValue,
        byte_size: usize,
        slot: usize,
    },
    /// Flattened into staging memory, then copied to a data buffer plus a
    /// two-int utility buffer `{total_bytes, 0}` on each device.
    ArrayLike {
        kind: ScalarKind,
        staged: Vec<u8>,
        total_bytes: usize,
        slot: usize,
    },
}

impl ScopeVariable {
    pub fn slot(&self) -> usize {
        match self {
            ScopeVariable::Scalar { slot, .. } | ScopeVariable::ArrayLike { slot, .. } => *slot,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, ScopeVariable::ArrayLike { .. })
    }
}

/// The explicit capture list attached to a function.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Captures {
    vars: Vec<ScopeVariable>,
}

impl Captures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalar<S: Scalar>(mut self, slot: usize, value: S) -> Self {
        self.vars.push(ScopeVariable::Scalar {
            value: value.into_value(),
            byte_size: S::KIND.byte_size(),
            slot,
        });
        self
    }

    pub fn array<S: Scalar>(mut self, slot: usize, values: &[S]) -> Self {
        let size = S::KIND.byte_size();
        let mut staged = vec![0u8; values.len() * size];
        for (cell, v) in staged.chunks_exact_mut(size).zip(values) {
            v.store(cell);
        }
        self.vars.push(ScopeVariable::ArrayLike {
            kind: S::KIND,
            total_bytes: staged.len(),
            staged,
            slot,
        });
        self
    }

    /// Slots must be exactly `0..len`, each used once.
    pub fn validate(&self) -> Result<()> {
        let mut seen = vec![false; self.vars.len()];
        for var in &self.vars {
            let slot = var.slot();
            match seen.get_mut(slot) {
                None => {
                    return Err(Error::InvalidScope(format!(
                        "slot {slot} out of range for {} captured variables",
                        self.vars.len()
                    )))
                }
                Some(true) => return Err(Error::InvalidScope(format!("slot {slot} captured twice"))),
                Some(used) => *used = true,
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Variables in capture order.
    pub fn iter(&self) -> impl Iterator<Item = &ScopeVariable> {
        self.vars.iter()
    }

    pub fn array_count(&self) -> usize {
        self.vars.iter().filter(|v| v.is_array()).count()
    }

    pub fn scalar_count(&self) -> usize {
        self.vars.len() - self.array_count()
    }
}

// ─── Source Generation ─────────────────────────────────────────────

/// What a generator sees of the function it must translate.
pub struct KernelShape<'a> {
    pub function: FunctionId,
    pub name: &'a str,
    pub input: &'a TypeDescriptor,
    pub output: &'a TypeDescriptor,
    pub scope: &'a Captures,
    /// The input is an index sequence stored as `{start, step}`.
    pub sequence: bool,
}

impl KernelShape<'_> {
    /// Parameters a kernel for this shape declares, excluding the optional
    /// deoptimization guard: input columns and their length, one per scope
    /// scalar, two per scope array, then output columns.
    pub fn expected_argument_count(&self) -> usize {
        self.input.number_of_components()
            + 1
            + self.scope.len()
            + self.scope.array_count()
            + self.output.number_of_components()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedKernel {
    pub source: String,
    pub entry_point: String,
    pub argument_count_hint: usize,
}

/// Produces device source for a function.
pub trait KernelSourceGenerator: Send + Sync {
    fn generate(&self, shape: &KernelShape<'_>) -> std::result::Result<GeneratedKernel, String>;
}

/// Hand-written kernels looked up by function name.
#[derive(Default)]
pub struct SourceTable {
    entries: RwLock<HashMap<String, GeneratedKernel>>,
}

impl SourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, kernel: GeneratedKernel) {
        self.entries.write().insert(name.into(), kernel);
    }
}

impl KernelSourceGenerator for SourceTable {
    fn generate(&self, shape: &KernelShape<'_>) -> std::result::Result<GeneratedKernel, String> {
        self.entries
            .read()
            .get(shape.name)
            .cloned()
            .ok_or_else(|| format!("no kernel source for `{}`", shape.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stage_arrays() {
        let captures = Captures::new().scalar(1, 2.5f64).array(0, &[1i16, -1, 3]);
        assert_eq!(captures.len(), 2);
        assert_eq!(captures.array_count(), 1);
        assert_eq!(captures.scalar_count(), 1);
        captures.validate().unwrap();
        let Some(ScopeVariable::ArrayLike { total_bytes, staged, .. }) = captures.iter().nth(1) else {
            panic!("array capture missing");
        };
        assert_eq!(*total_bytes, 6);
        assert_eq!(&staged[2..4], &(-1i16).to_le_bytes());
    }

    #[test]
    fn invalid_slots_rejected() {
        assert!(Captures::new().scalar(0, 1i32).scalar(0, 2i32).validate().is_err());
        assert!(Captures::new().scalar(2, 1i32).validate().is_err());
    }

    #[test]
    fn expected_arguments_count_scope_pairs() {
        let input = TypeDescriptor::tuple(vec![
            TypeDescriptor::Scalar(ScalarKind::Float),
            TypeDescriptor::Scalar(ScalarKind::Float),
        ])
        .unwrap();
        let output = TypeDescriptor::Scalar(ScalarKind::Float);
        let scope = Captures::new().scalar(0, 1.0f32).array(1, &[0.0f32; 4]);
        let shape = KernelShape {
            function: FunctionId::new(),
            name: "dot",
            input: &input,
            output: &output,
            scope: &scope,
            sequence: false,
        };
        assert_eq!(shape.expected_argument_count(), 2 + 1 + 3 + 1);
    }

    #[test]
    fn source_table_lookup() {
        let table = SourceTable::new();
        let kernel = GeneratedKernel {
            source: "fn k() {}".into(),
            entry_point: "k".into(),
            argument_count_hint: 3,
        };
        table.insert("k", kernel.clone());
        let output = TypeDescriptor::Scalar(ScalarKind::Int);
        let scope = Captures::new();
        let mut shape = KernelShape {
            function: FunctionId::new(),
            name: "k",
            input: &output,
            output: &output,
            scope: &scope,
            sequence: false,
        };
        assert_eq!(table.generate(&shape).unwrap(), kernel);
        shape.name = "missing";
        assert!(table.generate(&shape).is_err());
    }
}
