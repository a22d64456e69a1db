//! Device-layout descriptions of host values.
//!
//! A [`TypeDescriptor`] says how one element of a typed array is laid out on
//! a device: a single scalar column, one column per tuple field, or one
//! flattened column for a fixed-size array. [`ScalarKind::byte_size`] is the
//! only place element sizes are defined.

mod value;

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};

pub use value::{infer, Scalar, ScalarValue, Value};

/// Largest tuple the runtime can lay out.
pub const MAX_TUPLE_ARITY: usize = 11;
/// Deepest array nesting the runtime can flatten.
pub const MAX_ARRAY_DIMS: u8 = 3;

// ─── Scalar Kinds ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScalarKind {
    Int,
    Long,
    Float,
    Double,
    Short,
    Byte,
    Char,
    Boolean,
}

impl ScalarKind {
    pub const ALL: [ScalarKind; 8] = [
        ScalarKind::Int,
        ScalarKind::Long,
        ScalarKind::Float,
        ScalarKind::Double,
        ScalarKind::Short,
        ScalarKind::Byte,
        ScalarKind::Char,
        ScalarKind::Boolean,
    ];

    /// Bytes one value occupies in device memory.
    pub const fn byte_size(self) -> usize {
        match self {
            ScalarKind::Int => 4,
            ScalarKind::Long => 8,
            ScalarKind::Float => 4,
            ScalarKind::Double => 8,
            ScalarKind::Short => 2,
            ScalarKind::Byte => 1,
            ScalarKind::Char => 1,
            ScalarKind::Boolean => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarKind::Int => "int",
            ScalarKind::Long => "long",
            ScalarKind::Float => "float",
            ScalarKind::Double => "double",
            ScalarKind::Short => "short",
            ScalarKind::Byte => "byte",
            ScalarKind::Char => "char",
            ScalarKind::Boolean => "boolean",
        }
    }

    pub fn is_floating(self) -> bool {
        matches!(self, ScalarKind::Float | ScalarKind::Double)
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Type Descriptor ───────────────────────────────────────────────

/// Device-layout shape of one array element.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeDescriptor {
    Scalar(ScalarKind),
    /// Fields are always scalars; each becomes its own device buffer.
    Tuple(Vec<TypeDescriptor>),
    /// Stored as a single flattened buffer.
    Array { element: ScalarKind, dims: u8 },
}

impl TypeDescriptor {
    /// Build a tuple descriptor, checking arity and that every field is a scalar.
    pub fn tuple(fields: Vec<TypeDescriptor>) -> Result<Self> {
        if fields.is_empty() || fields.len() > MAX_TUPLE_ARITY {
            return Err(Error::UnsupportedType(format!(
                "tuple of arity {} (supported: 1..={MAX_TUPLE_ARITY})",
                fields.len()
            )));
        }
        if let Some((pos, field)) = fields
            .iter()
            .enumerate()
            .find(|(_, f)| !matches!(f, TypeDescriptor::Scalar(_)))
        {
            return Err(Error::UnsupportedType(format!(
                "tuple field {} is `{field}`, only scalars may appear in tuples",
                pos + 1
            )));
        }
        Ok(TypeDescriptor::Tuple(fields))
    }

    pub fn array(element: ScalarKind, dims: u8) -> Result<Self> {
        if dims == 0 || dims > MAX_ARRAY_DIMS {
            return Err(Error::UnsupportedType(format!(
                "{dims}-dimensional array (supported: 1..={MAX_ARRAY_DIMS})"
            )));
        }
        Ok(TypeDescriptor::Array { element, dims })
    }

    /// Number of device buffers one array of this type needs.
    pub fn number_of_components(&self) -> usize {
        match self {
            TypeDescriptor::Scalar(_) | TypeDescriptor::Array { .. } => 1,
            TypeDescriptor::Tuple(fields) => fields.len(),
        }
    }

    /// Scalar kind backing each column, in field order.
    pub fn column_kinds(&self) -> Vec<ScalarKind> {
        match self {
            TypeDescriptor::Scalar(kind) => vec![*kind],
            TypeDescriptor::Array { element, .. } => vec![*element],
            TypeDescriptor::Tuple(fields) => fields.iter().flat_map(|f| f.column_kinds()).collect(),
        }
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, TypeDescriptor::Tuple(_))
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Scalar(kind) => write!(f, "{kind}"),
            TypeDescriptor::Tuple(fields) => {
                write!(f, "Tuple{}<", fields.len())?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{field}")?;
                }
                f.write_str(">")
            }
            TypeDescriptor::Array { element, dims } => {
                write!(f, "{element}")?;
                for _ in 0..*dims {
                    f.write_str("[]")?;
                }
                Ok(())
            }
        }
    }
}

// ─── Column Layout ─────────────────────────────────────────────────

/// One host/device column: a scalar kind repeated `lanes` times per element.
///
/// Scalars and tuple fields have one lane; a fixed-size array element has as
/// many lanes as it has values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ColumnLayout {
    pub kind: ScalarKind,
    pub lanes: usize,
}

impl ColumnLayout {
    pub const fn scalar(kind: ScalarKind) -> Self {
        Self { kind, lanes: 1 }
    }

    /// Bytes per element in this column.
    pub const fn stride(&self) -> usize {
        self.kind.byte_size() * self.lanes
    }
}

// ─── Descriptor Cache ──────────────────────────────────────────────

/// Descriptors cached by static element type.
#[derive(Default)]
pub struct TypeCache {
    entries: RwLock<HashMap<TypeId, Arc<TypeDescriptor>>>,
}

impl TypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptor_of<T: crate::array::Element>(&self) -> Arc<TypeDescriptor> {
        let key = TypeId::of::<T>();
        if let Some(desc) = self.entries.read().get(&key) {
            return Arc::clone(desc);
        }
        let mut entries = self.entries.write();
        Arc::clone(entries.entry(key).or_insert_with(|| Arc::new(T::descriptor())))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_size_table() {
        let sizes: Vec<usize> = ScalarKind::ALL.iter().map(|k| k.byte_size()).collect();
        assert_eq!(sizes, vec![4, 8, 4, 8, 2, 1, 1, 1]);
    }

    #[test]
    fn tuple_components_match_arity() {
        let desc = TypeDescriptor::tuple(vec![
            TypeDescriptor::Scalar(ScalarKind::Int),
            TypeDescriptor::Scalar(ScalarKind::Double),
            TypeDescriptor::Scalar(ScalarKind::Boolean),
        ])
        .unwrap();
        assert_eq!(desc.number_of_components(), 3);
        assert_eq!(
            desc.column_kinds(),
            vec![ScalarKind::Int, ScalarKind::Double, ScalarKind::Boolean]
        );
        assert_eq!(desc.to_string(), "Tuple3<int, double, boolean>");
    }

    #[test]
    fn tuple_arity_bounds() {
        let field = TypeDescriptor::Scalar(ScalarKind::Float);
        assert!(TypeDescriptor::tuple(vec![]).is_err());
        assert!(TypeDescriptor::tuple(vec![field.clone(); 11]).is_ok());
        let err = TypeDescriptor::tuple(vec![field; 12]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(_)));
    }

    #[test]
    fn nested_tuple_rejected() {
        let inner = TypeDescriptor::tuple(vec![TypeDescriptor::Scalar(ScalarKind::Int)]).unwrap();
        let err = TypeDescriptor::tuple(vec![inner]).unwrap_err();
        assert!(err.to_string().contains("tuple field 1"));
    }

    #[test]
    fn array_is_one_component() {
        let desc = TypeDescriptor::array(ScalarKind::Short, 3).unwrap();
        assert_eq!(desc.number_of_components(), 1);
        assert_eq!(desc.to_string(), "short[][][]");
        assert!(TypeDescriptor::array(ScalarKind::Short, 4).is_err());
    }

    #[test]
    fn cache_returns_shared_descriptor() {
        let cache = TypeCache::new();
        let a = cache.descriptor_of::<(f32, f32)>();
        let b = cache.descriptor_of::<(f32, f32)>();
        assert!(Arc::ptr_eq(&a, &b));
        cache.descriptor_of::<i64>();
        assert_eq!(cache.len(), 2);
    }
}
