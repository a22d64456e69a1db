//! Host-resident typed arrays.
//!
//! A [`TypedArray`] stores its elements structure-of-arrays: one [`Column`]
//! of little-endian bytes per tuple field (or a single column for scalars and
//! fixed-size arrays). Columns are exactly what the marshalling layer copies
//! to and from devices, so no packing step sits between host and device.
//!
//! Arrays split into [`Slice`]s or disjoint [`SliceMut`]s without copying.

mod element;
mod slice;

use std::borrow::Cow;
use std::fmt;
use std::marker::PhantomData;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{ColumnLayout, TypeDescriptor};

pub use element::Element;
pub use slice::{chunks_of_size, fixed_chunks, Slice, SliceMut, Span};

/// Identity of one array allocation, used to key device buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArrayId(Uuid);

impl ArrayId {
    fn fresh() -> Self {
        ArrayId(Uuid::new_v4())
    }
}

impl fmt::Display for ArrayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the host columns of an array live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StorageMode {
    #[default]
    HostHeap,
    /// Page-locked staging memory used for device transfers.
    PinnedHost,
    /// Contents are authoritative on the device; host columns are a mirror.
    DeviceBacked,
}

/// A lazily described `i32` range: element `i` is `start + i * step`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sequence {
    pub start: i32,
    pub step: i32,
    pub total: usize,
}

impl Sequence {
    pub fn value_at(&self, index: usize) -> i32 {
        self.start.wrapping_add(self.step.wrapping_mul(index as i32))
    }
}

// ─── Columns ───────────────────────────────────────────────────────

/// Bytes of one scalar column.
#[derive(Clone, Debug, PartialEq)]
pub struct Column {
    layout: ColumnLayout,
    bytes: Vec<u8>,
}

impl Column {
    pub fn zeroed(layout: ColumnLayout, len: usize) -> Self {
        Self {
            layout,
            bytes: vec![0; layout.stride() * len],
        }
    }

    pub fn layout(&self) -> ColumnLayout {
        self.layout
    }

    /// Number of elements stored.
    pub fn len(&self) -> usize {
        match self.layout.stride() {
            0 => 0,
            stride => self.bytes.len() / stride,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl AsRef<[u8]> for Column {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl AsMut<[u8]> for Column {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

// ─── Typed Array ───────────────────────────────────────────────────

pub struct TypedArray<T: Element> {
    id: ArrayId,
    len: usize,
    descriptor: TypeDescriptor,
    layout: Vec<ColumnLayout>,
    columns: Vec<Column>,
    storage_mode: StorageMode,
    sequence: Option<Sequence>,
    _marker: PhantomData<T>,
}

impl<T: Element> TypedArray<T> {
    /// A zero-filled array of `len` elements.
    pub fn new(len: usize) -> Self {
        let layout = T::layout();
        let columns = layout.iter().map(|l| Column::zeroed(*l, len)).collect();
        Self {
            id: ArrayId::fresh(),
            len,
            descriptor: T::descriptor(),
            layout,
            columns,
            storage_mode: StorageMode::default(),
            sequence: None,
            _marker: PhantomData,
        }
    }

    pub fn from_vec(values: Vec<T>) -> Self {
        Self::from_slice(&values)
    }

    pub fn from_slice(values: &[T]) -> Self {
        let mut array = Self::new(values.len());
        for (i, v) in values.iter().enumerate() {
            v.write_to(&mut array.columns, i);
        }
        array
    }

    pub fn from_fn(len: usize, mut f: impl FnMut(usize) -> T) -> Self {
        let mut array = Self::new(len);
        for i in 0..len {
            f(i).write_to(&mut array.columns, i);
        }
        array
    }

    pub(crate) fn from_column_bytes(len: usize, layout: &[ColumnLayout], bytes: Vec<Vec<u8>>) -> Self {
        let mut array = Self::new(0);
        array.len = len;
        array.columns = layout
            .iter()
            .zip(bytes)
            .map(|(layout, bytes)| Column {
                layout: *layout,
                bytes,
            })
            .collect();
        array
    }

    pub fn with_storage_mode(mut self, mode: StorageMode) -> Self {
        self.storage_mode = mode;
        self
    }

    pub fn id(&self) -> ArrayId {
        self.id
    }

    /// Logical element count. For sequences this is the full range length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    pub fn layout(&self) -> &[ColumnLayout] {
        &self.layout
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub(crate) fn columns_mut(&mut self) -> &mut [Column] {
        &mut self.columns
    }

    pub fn column(&self, index: usize) -> &Column {
        &self.columns[index]
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.storage_mode
    }

    pub fn set_storage_mode(&mut self, mode: StorageMode) {
        self.storage_mode = mode;
    }

    /// Elements actually held in the host columns.
    pub fn stored_len(&self) -> usize {
        self.columns.first().map_or(self.len, Column::len)
    }

    pub fn is_sequence(&self) -> bool {
        self.sequence.is_some()
    }

    pub fn sequence_info(&self) -> Option<Sequence> {
        self.sequence
    }

    pub fn total_size_when_sequence(&self) -> usize {
        self.sequence.map_or(self.len, |s| s.total)
    }

    /// # Panics
    /// If `index >= self.len()`.
    pub fn get(&self, index: usize) -> T {
        assert!(index < self.len, "index {index} out of array of {}", self.len);
        match self.sequence {
            Some(seq) => {
                let bytes = seq.value_at(index).to_le_bytes();
                T::read_from(&[&bytes[..]], 0)
            }
            None => T::read_from(&self.columns, index),
        }
    }

    /// # Panics
    /// If `index >= self.len()` or the array is a sequence.
    pub fn set(&mut self, index: usize, value: T) {
        assert!(index < self.len, "index {index} out of array of {}", self.len);
        assert!(self.sequence.is_none(), "sequences are read-only");
        value.write_to(&mut self.columns, index);
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len).map(move |i| self.get(i))
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }

    /// The array with any sequence materialized into real columns.
    pub fn expanded(&self) -> Cow<'_, Self> {
        match self.sequence {
            None => Cow::Borrowed(self),
            Some(_) => Cow::Owned(Self::from_fn(self.len, |i| self.get(i))),
        }
    }

    fn check_flat(&self) -> Result<()> {
        if self.sequence.is_some() {
            return Err(Error::InvalidPartition(
                "sequence arrays must be expanded before slicing".into(),
            ));
        }
        Ok(())
    }

    fn check_span(&self, span: Span) -> Result<()> {
        self.check_flat()?;
        if span.end() > self.len {
            return Err(Error::InvalidPartition(format!(
                "slice [{}, {}) exceeds array of {} elements",
                span.offset,
                span.end(),
                self.len
            )));
        }
        Ok(())
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<Slice<'_, T>> {
        let span = Span::new(offset, len);
        self.check_span(span)?;
        Ok(Slice::new(self, span))
    }

    pub fn slice_mut(&mut self, offset: usize, len: usize) -> Result<SliceMut<'_, T>> {
        let span = Span::new(offset, len);
        self.check_span(span)?;
        Ok(slice::split_columns_mut(self, &[span]).remove(0))
    }

    pub fn split_in_fixed_number_of_chunks(&self, n: usize) -> Result<Vec<Slice<'_, T>>> {
        self.check_flat()?;
        Ok(fixed_chunks(self.len, n)?
            .into_iter()
            .map(|span| Slice::new(self, span))
            .collect())
    }

    pub fn split_in_fixed_number_of_chunks_mut(&mut self, n: usize) -> Result<Vec<SliceMut<'_, T>>> {
        self.check_flat()?;
        let spans = fixed_chunks(self.len, n)?;
        Ok(slice::split_columns_mut(self, &spans))
    }

    pub fn split_in_chunks_of_size(&self, chunk: usize) -> Result<Vec<Slice<'_, T>>> {
        self.check_flat()?;
        Ok(chunks_of_size(self.len, chunk)?
            .into_iter()
            .map(|span| Slice::new(self, span))
            .collect())
    }

    pub fn split_in_chunks_of_size_mut(&mut self, chunk: usize) -> Result<Vec<SliceMut<'_, T>>> {
        self.check_flat()?;
        let spans = chunks_of_size(self.len, chunk)?;
        Ok(slice::split_columns_mut(self, &spans))
    }
}

impl TypedArray<i32> {
    /// `total` values `start, start + step, ...` described by two stored ints.
    pub fn sequence(start: i32, step: i32, total: usize) -> Self {
        let mut array = Self::from_slice(&[start, step]);
        array.len = total;
        array.sequence = Some(Sequence { start, step, total });
        array
    }
}

/// Clones own fresh device identity.
impl<T: Element> Clone for TypedArray<T> {
    fn clone(&self) -> Self {
        Self {
            id: ArrayId::fresh(),
            len: self.len,
            descriptor: self.descriptor.clone(),
            layout: self.layout.clone(),
            columns: self.columns.clone(),
            storage_mode: self.storage_mode,
            sequence: self.sequence,
            _marker: PhantomData,
        }
    }
}

impl<T: Element> fmt::Debug for TypedArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedArray")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("descriptor", &self.descriptor.to_string())
            .field("storage_mode", &self.storage_mode)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl<T: Element> FromIterator<T> for TypedArray<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}
