//! Contiguous views over a typed array and the two splitting rules.

use std::marker::PhantomData;

use super::{Element, TypedArray};
use crate::error::{Error, Result};
use crate::types::ColumnLayout;

/// Index range `[offset, offset + len)` within a parent array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub offset: usize,
    pub len: usize,
}

impl Span {
    pub fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// `n` contiguous spans; every span holds `len / n` elements except the
/// last, which also takes the remainder.
pub fn fixed_chunks(len: usize, n: usize) -> Result<Vec<Span>> {
    if n == 0 {
        return Err(Error::InvalidPartition("cannot split into zero chunks".into()));
    }
    let base = len / n;
    let spans = (0..n)
        .map(|i| {
            let extra = if i == n - 1 { len % n } else { 0 };
            Span::new(i * base, base + extra)
        })
        .collect();
    Ok(spans)
}

/// `ceil(len / chunk)` spans of `chunk` elements, the last one shorter.
pub fn chunks_of_size(len: usize, chunk: usize) -> Result<Vec<Span>> {
    if chunk == 0 {
        return Err(Error::InvalidPartition("chunk size must be positive".into()));
    }
    Ok((0..len.div_ceil(chunk))
        .map(|i| {
            let offset = i * chunk;
            Span::new(offset, chunk.min(len - offset))
        })
        .collect())
}

// ─── Read-only Slice ───────────────────────────────────────────────

/// A non-owning read view of part of a [`TypedArray`].
pub struct Slice<'a, T: Element> {
    span: Span,
    layout: Vec<ColumnLayout>,
    columns: Vec<&'a [u8]>,
    _marker: PhantomData<T>,
}

impl<'a, T: Element> Slice<'a, T> {
    pub(super) fn new(array: &'a TypedArray<T>, span: Span) -> Self {
        let columns = array
            .columns()
            .iter()
            .map(|c| {
                let stride = c.layout().stride();
                &c.bytes()[span.offset * stride..span.end() * stride]
            })
            .collect();
        Self {
            span,
            layout: array.layout().to_vec(),
            columns,
            _marker: PhantomData,
        }
    }

    /// Position of the first element in the parent.
    pub fn offset(&self) -> usize {
        self.span.offset
    }

    pub fn len(&self) -> usize {
        self.span.len
    }

    pub fn is_empty(&self) -> bool {
        self.span.len == 0
    }

    pub fn span(&self) -> Span {
        self.span
    }

    /// Element `index` relative to the start of the slice.
    ///
    /// # Panics
    /// If `index >= self.len()`.
    pub fn get(&self, index: usize) -> T {
        assert!(index < self.span.len, "index {index} out of slice of {}", self.span.len);
        T::read_from(&self.columns, index)
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.span.len).map(move |i| T::read_from(&self.columns, i))
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }

    /// Raw bytes of column `column` covered by the slice.
    pub fn column_bytes(&self, column: usize) -> &'a [u8] {
        self.columns[column]
    }

    /// Copy the viewed range into a fresh array.
    pub fn to_array(&self) -> TypedArray<T> {
        TypedArray::from_column_bytes(
            self.span.len,
            &self.layout,
            self.columns.iter().map(|c| c.to_vec()).collect(),
        )
    }
}

// ─── Mutable Slice ─────────────────────────────────────────────────

/// A non-owning mutable view. Writes land in the parent array.
///
/// Slices produced by one split never overlap, so they can be handed to
/// different threads.
pub struct SliceMut<'a, T: Element> {
    span: Span,
    columns: Vec<&'a mut [u8]>,
    _marker: PhantomData<T>,
}

impl<'a, T: Element> SliceMut<'a, T> {
    pub fn offset(&self) -> usize {
        self.span.offset
    }

    pub fn len(&self) -> usize {
        self.span.len
    }

    pub fn is_empty(&self) -> bool {
        self.span.len == 0
    }

    pub fn span(&self) -> Span {
        self.span
    }

    /// # Panics
    /// If `index >= self.len()`.
    pub fn get(&self, index: usize) -> T {
        assert!(index < self.span.len, "index {index} out of slice of {}", self.span.len);
        T::read_from(&self.columns, index)
    }

    /// # Panics
    /// If `index >= self.len()`.
    pub fn set(&mut self, index: usize, value: T) {
        assert!(index < self.span.len, "index {index} out of slice of {}", self.span.len);
        value.write_to(&mut self.columns, index);
    }

    /// Copy `values` into the start of the slice.
    pub fn copy_from(&mut self, values: &Slice<'_, T>) -> Result<()> {
        if values.len() != self.span.len {
            return Err(Error::ShapeMismatch {
                expected: self.span.len,
                found: values.len(),
            });
        }
        for (dst, src) in self.columns.iter_mut().zip(&values.columns) {
            dst.copy_from_slice(src);
        }
        Ok(())
    }

    pub fn column_bytes_mut(&mut self, column: usize) -> &mut [u8] {
        self.columns[column]
    }
}

/// Cut every column along `spans`, which must be contiguous and ascending.
pub(super) fn split_columns_mut<'a, T: Element>(
    array: &'a mut TypedArray<T>,
    spans: &[Span],
) -> Vec<SliceMut<'a, T>> {
    let mut per_span: Vec<Vec<&'a mut [u8]>> = spans.iter().map(|_| Vec::new()).collect();
    for column in array.columns_mut() {
        let stride = column.layout().stride();
        let mut rest: &'a mut [u8] = column.bytes_mut();
        let mut cursor = 0;
        for (parts, span) in per_span.iter_mut().zip(spans) {
            let skip = (span.offset - cursor) * stride;
            let (_, tail) = std::mem::take(&mut rest).split_at_mut(skip);
            let (head, tail) = tail.split_at_mut(span.len * stride);
            parts.push(head);
            rest = tail;
            cursor = span.end();
        }
    }
    per_span
        .into_iter()
        .zip(spans)
        .map(|(columns, span)| SliceMut {
            span: *span,
            columns,
            _marker: PhantomData,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remainder_goes_last() {
        let lens: Vec<usize> = fixed_chunks(103, 4).unwrap().iter().map(|s| s.len).collect();
        assert_eq!(lens, vec![25, 25, 25, 28]);
    }

    #[test]
    fn fixed_chunks_cover_range() {
        for (len, n) in [(0, 3), (1, 4), (7, 7), (1000, 9)] {
            let spans = fixed_chunks(len, n).unwrap();
            assert_eq!(spans.len(), n);
            assert_eq!(spans.iter().map(|s| s.len).sum::<usize>(), len);
            for pair in spans.windows(2) {
                assert_eq!(pair[0].end(), pair[1].offset);
            }
        }
        assert!(fixed_chunks(10, 0).is_err());
    }

    #[test]
    fn chunks_of_size_last_shorter() {
        let spans = chunks_of_size(10, 4).unwrap();
        assert_eq!(
            spans,
            vec![Span::new(0, 4), Span::new(4, 4), Span::new(8, 2)]
        );
        assert!(chunks_of_size(0, 4).unwrap().is_empty());
        assert!(chunks_of_size(4, 0).is_err());
    }

    #[test]
    fn disjoint_mut_slices_write_parent() {
        let mut array = TypedArray::<(i32, f32)>::new(10);
        {
            let mut parts = array.split_in_fixed_number_of_chunks_mut(3).unwrap();
            std::thread::scope(|s| {
                for part in parts.iter_mut() {
                    s.spawn(move || {
                        for i in 0..part.len() {
                            let global = (part.offset() + i) as i32;
                            part.set(i, (global, global as f32 * 0.5));
                        }
                    });
                }
            });
        }
        assert_eq!(array.get(9), (9, 4.5));
        assert_eq!(array.get(0), (0, 0.0));
    }

    #[test]
    fn slice_reads_at_offset() {
        let array = TypedArray::from_vec((0..20i64).collect());
        let slice = array.slice(5, 3).unwrap();
        assert_eq!(slice.to_vec(), vec![5, 6, 7]);
        assert_eq!(slice.to_array().to_vec(), vec![5, 6, 7]);
        assert!(array.slice(18, 3).is_err());
    }
}
