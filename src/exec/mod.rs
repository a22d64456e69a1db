//! Array functions: the host, threaded and device maps, reductions, and
//! their composition.
//!
//! Every function turns one typed array into another through
//! [`ArrayFunction::apply`]. Functions compose with
//! [`ArrayFunction::and_then`] or run chunk-by-chunk in a [`Pipeline`].

pub mod accel;
pub mod pipeline;

use std::marker::PhantomData;
use std::thread;

use crate::array::{Element, TypedArray};
use crate::deopt;
use crate::error::Result;

pub use accel::MapAccelerator;
pub use pipeline::Pipeline;

pub trait ArrayFunction<I: Element, O: Element>: Send {
    fn apply(&mut self, input: &TypedArray<I>) -> Result<TypedArray<O>>;

    /// Feed this function's output into `next`.
    fn and_then<P, G>(self, next: G) -> AndThen<Self, G, O>
    where
        Self: Sized,
        P: Element,
        G: ArrayFunction<O, P>,
    {
        AndThen {
            first: self,
            second: next,
            _mid: PhantomData,
        }
    }
}

pub struct AndThen<F, G, M> {
    first: F,
    second: G,
    _mid: PhantomData<fn() -> M>,
}

impl<I, M, O, F, G> ArrayFunction<I, O> for AndThen<F, G, M>
where
    I: Element,
    M: Element,
    O: Element,
    F: ArrayFunction<I, M>,
    G: ArrayFunction<M, O>,
{
    fn apply(&mut self, input: &TypedArray<I>) -> Result<TypedArray<O>> {
        let mid = self.first.apply(input)?;
        self.second.apply(&mid)
    }
}

// ─── Maps ──────────────────────────────────────────────────────────

/// Sequential element-wise map on the calling thread.
pub struct Map<F> {
    f: F,
}

impl<F> Map<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<I, O, F> ArrayFunction<I, O> for Map<F>
where
    I: Element,
    O: Element,
    F: Fn(I) -> O + Send,
{
    fn apply(&mut self, input: &TypedArray<I>) -> Result<TypedArray<O>> {
        Ok(TypedArray::from_fn(input.len(), |i| (self.f)(input.get(i))))
    }
}

/// Element-wise map over a fixed number of threads, one chunk each.
pub struct MapThreads<F> {
    f: F,
    threads: usize,
}

impl<F> MapThreads<F> {
    pub fn new(f: F, threads: usize) -> Self {
        Self {
            f,
            threads: threads.max(1),
        }
    }

    /// One thread per available core.
    pub fn with_available_parallelism(f: F) -> Self {
        Self::new(f, thread::available_parallelism().map_or(1, |n| n.get()))
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

impl<I, O, F> ArrayFunction<I, O> for MapThreads<F>
where
    I: Element,
    O: Element,
    F: Fn(I) -> O + Send + Sync,
{
    fn apply(&mut self, input: &TypedArray<I>) -> Result<TypedArray<O>> {
        let mut output = TypedArray::new(input.len());
        deopt::parallel_map(input, &mut output, self.threads, &self.f)?;
        Ok(output)
    }
}

// ─── Reductions ────────────────────────────────────────────────────

/// Sequential left fold from a neutral element. The result is a
/// one-element array.
pub struct Reduce<T, F> {
    neutral: T,
    f: F,
}

impl<T: Element, F: Fn(T, T) -> T> Reduce<T, F> {
    pub fn new(neutral: T, f: F) -> Self {
        Self { neutral, f }
    }

    pub fn fold(&self, input: &TypedArray<T>) -> T {
        input.iter().fold(self.neutral, &self.f)
    }
}

impl<T, F> ArrayFunction<T, T> for Reduce<T, F>
where
    T: Element,
    F: Fn(T, T) -> T + Send,
{
    fn apply(&mut self, input: &TypedArray<T>) -> Result<TypedArray<T>> {
        Ok(TypedArray::from_vec(vec![self.fold(input)]))
    }
}

/// Per-thread partial folds, then a sequential fold of the partials.
///
/// `f` must be associative and `neutral` its identity for the result to
/// match [`Reduce`].
pub struct ReduceThreads<T, F> {
    neutral: T,
    f: F,
    threads: usize,
}

impl<T: Element, F: Fn(T, T) -> T + Sync> ReduceThreads<T, F> {
    pub fn new(neutral: T, f: F, threads: usize) -> Self {
        Self {
            neutral,
            f,
            threads: threads.max(1),
        }
    }

    pub fn fold(&self, input: &TypedArray<T>) -> Result<T> {
        let input = input.expanded();
        let threads = self.threads.min(input.len().max(1));
        let slices = input.split_in_fixed_number_of_chunks(threads)?;
        let (neutral, f) = (self.neutral, &self.f);
        let partials: Vec<T> = thread::scope(|s| {
            let workers: Vec<_> = slices
                .into_iter()
                .map(|slice| s.spawn(move || slice.iter().fold(neutral, f)))
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().unwrap_or_else(|payload| std::panic::resume_unwind(payload)))
                .collect()
        });
        Ok(partials.into_iter().fold(self.neutral, &self.f))
    }
}

impl<T, F> ArrayFunction<T, T> for ReduceThreads<T, F>
where
    T: Element,
    F: Fn(T, T) -> T + Send + Sync,
{
    fn apply(&mut self, input: &TypedArray<T>) -> Result<TypedArray<T>> {
        Ok(TypedArray::from_vec(vec![self.fold(input)?]))
    }
}
