//! Static element types and their column encoding.

use crate::types::{ColumnLayout, Scalar, ScalarKind, TypeDescriptor};

/// A host type that can live in a [`TypedArray`](super::TypedArray).
///
/// Implemented for the eight scalar types, tuples of 1 to 11 scalars and
/// fixed-size arrays of a scalar. Each tuple field is written to its own
/// column; array lanes are written contiguously into one column.
pub trait Element: Copy + Send + Sync + 'static {
    fn descriptor() -> TypeDescriptor;

    /// One entry per host/device column.
    fn layout() -> Vec<ColumnLayout>;

    /// Encode `self` as element `index` of `columns`.
    fn write_to<Col: AsMut<[u8]>>(self, columns: &mut [Col], index: usize);

    /// Decode element `index` of `columns`.
    fn read_from<Col: AsRef<[u8]>>(columns: &[Col], index: usize) -> Self;
}

fn cell(kind: ScalarKind, index: usize) -> std::ops::Range<usize> {
    let size = kind.byte_size();
    index * size..(index + 1) * size
}

macro_rules! scalar_element {
    ($($ty:ty),*) => {
        $(
            impl Element for $ty {
                fn descriptor() -> TypeDescriptor {
                    TypeDescriptor::Scalar(<$ty as Scalar>::KIND)
                }

                fn layout() -> Vec<ColumnLayout> {
                    vec![ColumnLayout::scalar(<$ty as Scalar>::KIND)]
                }

                fn write_to<Col: AsMut<[u8]>>(self, columns: &mut [Col], index: usize) {
                    let range = cell(<$ty as Scalar>::KIND, index);
                    <$ty as Scalar>::store(self, &mut columns[0].as_mut()[range]);
                }

                fn read_from<Col: AsRef<[u8]>>(columns: &[Col], index: usize) -> Self {
                    let range = cell(<$ty as Scalar>::KIND, index);
                    <$ty as Scalar>::load(&columns[0].as_ref()[range])
                }
            }
        )*
    };
}

scalar_element!(i32, i64, f32, f64, i16, i8, u8, bool);

macro_rules! tuple_element {
    ($($name:ident $idx:tt),+) => {
        impl<$($name: Scalar),+> Element for ($($name,)+) {
            fn descriptor() -> TypeDescriptor {
                TypeDescriptor::Tuple(vec![$(TypeDescriptor::Scalar(<$name as Scalar>::KIND)),+])
            }

            fn layout() -> Vec<ColumnLayout> {
                vec![$(ColumnLayout::scalar(<$name as Scalar>::KIND)),+]
            }

            fn write_to<Col: AsMut<[u8]>>(self, columns: &mut [Col], index: usize) {
                $(
                    let range = cell(<$name as Scalar>::KIND, index);
                    <$name as Scalar>::store(self.$idx, &mut columns[$idx].as_mut()[range]);
                )+
            }

            fn read_from<Col: AsRef<[u8]>>(columns: &[Col], index: usize) -> Self {
                ($(
                    <$name as Scalar>::load(&columns[$idx].as_ref()[cell(<$name as Scalar>::KIND, index)]),
                )+)
            }
        }
    };
}

tuple_element!(A 0);
tuple_element!(A 0, B 1);
tuple_element!(A 0, B 1, C 2);
tuple_element!(A 0, B 1, C 2, D 3);
tuple_element!(A 0, B 1, C 2, D 3, E 4);
tuple_element!(A 0, B 1, C 2, D 3, E 4, F 5);
tuple_element!(A 0, B 1, C 2, D 3, E 4, F 5, G 6);
tuple_element!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7);
tuple_element!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8);
tuple_element!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9);
tuple_element!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7, I 8, J 9, K 10);

impl<S: Scalar, const N: usize> Element for [S; N] {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::Array {
            element: S::KIND,
            dims: 1,
        }
    }

    fn layout() -> Vec<ColumnLayout> {
        vec![ColumnLayout {
            kind: S::KIND,
            lanes: N,
        }]
    }

    fn write_to<Col: AsMut<[u8]>>(self, columns: &mut [Col], index: usize) {
        let column = columns[0].as_mut();
        for (lane, value) in self.into_iter().enumerate() {
            value.store(&mut column[cell(S::KIND, index * N + lane)]);
        }
    }

    fn read_from<Col: AsRef<[u8]>>(columns: &[Col], index: usize) -> Self {
        let column = columns[0].as_ref();
        std::array::from_fn(|lane| S::load(&column[cell(S::KIND, index * N + lane)]))
    }
}
