//! Host values and their inference into descriptors.

use std::fmt::Debug;

use super::{ScalarKind, TypeDescriptor, MAX_ARRAY_DIMS, MAX_TUPLE_ARITY};
use crate::error::{Error, Result};

// ─── Scalars ───────────────────────────────────────────────────────

/// A host type that maps onto exactly one [`ScalarKind`].
///
/// Values are stored little-endian, `KIND.byte_size()` bytes each.
pub trait Scalar: Copy + Default + PartialEq + Debug + Send + Sync + 'static {
    const KIND: ScalarKind;

    fn store(self, out: &mut [u8]);
    fn load(bytes: &[u8]) -> Self;
    fn into_value(self) -> ScalarValue;
}

macro_rules! numeric_scalar {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl Scalar for $ty {
                const KIND: ScalarKind = ScalarKind::$kind;

                fn store(self, out: &mut [u8]) {
                    out[..std::mem::size_of::<$ty>()].copy_from_slice(&self.to_le_bytes());
                }

                fn load(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                    <$ty>::from_le_bytes(raw)
                }

                fn into_value(self) -> ScalarValue {
                    ScalarValue::$kind(self)
                }
            }
        )*
    };
}

numeric_scalar! {
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    i16 => Short,
    i8 => Byte,
    u8 => Char,
}

impl Scalar for bool {
    const KIND: ScalarKind = ScalarKind::Boolean;

    fn store(self, out: &mut [u8]) {
        out[0] = self as u8;
    }

    fn load(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn into_value(self) -> ScalarValue {
        ScalarValue::Boolean(self)
    }
}

/// A single scalar of any supported kind.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScalarValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Short(i16),
    Byte(i8),
    Char(u8),
    Boolean(bool),
}

impl ScalarValue {
    pub fn kind(&self) -> ScalarKind {
        match self {
            ScalarValue::Int(_) => ScalarKind::Int,
            ScalarValue::Long(_) => ScalarKind::Long,
            ScalarValue::Float(_) => ScalarKind::Float,
            ScalarValue::Double(_) => ScalarKind::Double,
            ScalarValue::Short(_) => ScalarKind::Short,
            ScalarValue::Byte(_) => ScalarKind::Byte,
            ScalarValue::Char(_) => ScalarKind::Char,
            ScalarValue::Boolean(_) => ScalarKind::Boolean,
        }
    }

    /// Device representation, `kind().byte_size()` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.kind().byte_size()];
        match *self {
            ScalarValue::Int(v) => v.store(&mut out),
            ScalarValue::Long(v) => v.store(&mut out),
            ScalarValue::Float(v) => v.store(&mut out),
            ScalarValue::Double(v) => v.store(&mut out),
            ScalarValue::Short(v) => v.store(&mut out),
            ScalarValue::Byte(v) => v.store(&mut out),
            ScalarValue::Char(v) => v.store(&mut out),
            ScalarValue::Boolean(v) => v.store(&mut out),
        }
        out
    }
}

// ─── Values ────────────────────────────────────────────────────────

/// A dynamically shaped host value, used to infer descriptors from samples.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Scalar(ScalarValue),
    Tuple(Vec<Value>),
    /// Rows of a (possibly nested) array.
    Array(Vec<Value>),
    /// Any other host type, named for diagnostics.
    Other(String),
}

impl From<ScalarValue> for Value {
    fn from(v: ScalarValue) -> Self {
        Value::Scalar(v)
    }
}

/// Infer the device layout of a sample value.
///
/// Fails before anything touches a device when the value is not a scalar,
/// a tuple of 1 to 11 scalars, or a rectangular array of up to three
/// dimensions over one scalar kind.
pub fn infer(value: &Value) -> Result<TypeDescriptor> {
    match value {
        Value::Scalar(v) => Ok(TypeDescriptor::Scalar(v.kind())),
        Value::Tuple(fields) => {
            if fields.is_empty() || fields.len() > MAX_TUPLE_ARITY {
                return Err(Error::UnsupportedType(format!(
                    "tuple of arity {} (supported: 1..={MAX_TUPLE_ARITY})",
                    fields.len()
                )));
            }
            let inferred = fields.iter().map(infer).collect::<Result<Vec<_>>>()?;
            TypeDescriptor::tuple(inferred)
        }
        Value::Array(rows) => {
            let (element, dims, _) = array_shape(rows)?;
            TypeDescriptor::array(element, dims)
        }
        Value::Other(name) => Err(Error::UnsupportedType(name.clone())),
    }
}

/// Element kind, dimensionality and outer length of a rectangular array.
fn array_shape(rows: &[Value]) -> Result<(ScalarKind, u8, usize)> {
    let first = rows
        .first()
        .ok_or_else(|| Error::UnsupportedType("empty array has no element type".into()))?;
    match first {
        Value::Scalar(head) => {
            let kind = head.kind();
            for row in rows {
                match row {
                    Value::Scalar(v) if v.kind() == kind => {}
                    other => {
                        return Err(Error::UnsupportedType(format!(
                            "array mixes {kind} with {}",
                            describe(other)
                        )))
                    }
                }
            }
            Ok((kind, 1, rows.len()))
        }
        Value::Array(inner) => {
            let shape = array_shape(inner)?;
            for row in &rows[1..] {
                let Value::Array(inner) = row else {
                    return Err(Error::UnsupportedType(format!(
                        "array mixes nested arrays with {}",
                        describe(row)
                    )));
                };
                if array_shape(inner)? != shape {
                    return Err(Error::UnsupportedType("ragged array".into()));
                }
            }
            let dims = shape.1 + 1;
            if dims > MAX_ARRAY_DIMS {
                return Err(Error::UnsupportedType(format!(
                    "{dims}-dimensional array (supported: 1..={MAX_ARRAY_DIMS})"
                )));
            }
            Ok((shape.0, dims, rows.len()))
        }
        other => Err(Error::UnsupportedType(format!("array of {}", describe(other)))),
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Scalar(v) => v.kind().to_string(),
        Value::Tuple(fields) => format!("tuple of arity {}", fields.len()),
        Value::Array(_) => "array".into(),
        Value::Other(name) => name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float(v: f32) -> Value {
        Value::Scalar(ScalarValue::Float(v))
    }

    #[test]
    fn scalar_store_load() {
        let mut buf = [0u8; 8];
        (-7i64).store(&mut buf);
        assert_eq!(i64::load(&buf), -7);
        true.store(&mut buf);
        assert!(bool::load(&buf));
        assert_eq!(b'x'.into_value().kind(), ScalarKind::Char);
    }

    #[test]
    fn scalar_value_bytes() {
        assert_eq!(ScalarValue::Int(1).to_bytes(), vec![1, 0, 0, 0]);
        assert_eq!(ScalarValue::Boolean(true).to_bytes(), vec![1]);
        assert_eq!(ScalarValue::Double(0.0).to_bytes().len(), 8);
    }

    #[test]
    fn infer_pair_of_floats() {
        let desc = infer(&Value::Tuple(vec![float(1.0), float(2.0)])).unwrap();
        assert_eq!(
            desc,
            TypeDescriptor::Tuple(vec![
                TypeDescriptor::Scalar(ScalarKind::Float),
                TypeDescriptor::Scalar(ScalarKind::Float),
            ])
        );
        assert_eq!(desc.number_of_components(), 2);
    }

    #[test]
    fn infer_matrix() {
        let row = || Value::Array(vec![float(0.0), float(1.0)]);
        let desc = infer(&Value::Array(vec![row(), row(), row()])).unwrap();
        assert_eq!(
            desc,
            TypeDescriptor::Array {
                element: ScalarKind::Float,
                dims: 2
            }
        );
    }

    #[test]
    fn infer_rejects_unsupported_shapes() {
        let cube = |v: Value| Value::Array(vec![Value::Array(vec![Value::Array(vec![v])])]);
        let four_dims = Value::Array(vec![cube(float(1.0))]);
        let ragged = Value::Array(vec![
            Value::Array(vec![float(1.0)]),
            Value::Array(vec![float(1.0), float(2.0)]),
        ]);
        let mixed = Value::Array(vec![float(1.0), Value::Scalar(ScalarValue::Int(1))]);
        let wide = Value::Tuple(vec![float(0.0); 12]);
        let nested = Value::Tuple(vec![Value::Tuple(vec![float(0.0)])]);

        assert!(infer(&cube(float(1.0))).is_ok());
        for value in [
            four_dims,
            ragged,
            mixed,
            wide,
            nested,
            Value::Array(vec![]),
            Value::Other("String".into()),
        ] {
            let err = infer(&value).unwrap_err();
            assert!(matches!(err, Error::UnsupportedType(_)), "{value:?} gave {err}");
        }
    }
}
