//! Chunked pipelines of two to four array functions.
//!
//! The input is cut into chunks of at most `chunk_size` elements. A
//! producer copies each chunk out, every stage runs on its own thread, and
//! stages hand chunks to each other through single-slot channels, so
//! different stages work on different chunks at the same time. The calling
//! thread lands finished chunks in the output.
//!
//! A stage error stops the pipeline and is returned from `apply`.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::array::{chunks_of_size, Element, TypedArray};
use crate::error::{Error, Result};
use crate::exec::ArrayFunction;
use crate::profiler::{ProfileEvent, ProfileKind, TimestampSink};

pub const MIN_STAGES: usize = 2;
pub const MAX_STAGES: usize = 4;

const DEFAULT_CHUNK: usize = 1024;

type Chunk = Box<dyn Any + Send>;
type Packet = Result<(usize, Chunk)>;

trait ErasedStage: Send {
    fn run(&mut self, input: Chunk) -> Result<Chunk>;
}

struct Stage<A, B, F> {
    function: F,
    _types: PhantomData<fn(A) -> B>,
}

impl<A, B, F> ErasedStage for Stage<A, B, F>
where
    A: Element,
    B: Element,
    F: ArrayFunction<A, B>,
{
    fn run(&mut self, input: Chunk) -> Result<Chunk> {
        let chunk = input
            .downcast::<TypedArray<A>>()
            .map_err(|_| Error::Pipeline("chunk does not match stage input type".into()))?;
        Ok(Box::new(self.function.apply(&chunk)?))
    }
}

pub struct Pipeline<I, O> {
    stages: Vec<Box<dyn ErasedStage>>,
    chunk_size: usize,
    sink: Option<Arc<dyn TimestampSink>>,
    _types: PhantomData<fn(I) -> O>,
}

impl<I: Element, O: Element> Pipeline<I, O> {
    pub fn new<F>(first: F) -> Self
    where
        F: ArrayFunction<I, O> + 'static,
    {
        Self {
            stages: vec![Box::new(Stage {
                function: first,
                _types: PhantomData,
            })],
            chunk_size: DEFAULT_CHUNK,
            sink: None,
            _types: PhantomData,
        }
    }

    /// Append a stage consuming this pipeline's output.
    pub fn then<P, G>(mut self, next: G) -> Pipeline<I, P>
    where
        P: Element,
        G: ArrayFunction<O, P> + 'static,
    {
        self.stages.push(Box::new(Stage {
            function: next,
            _types: PhantomData,
        }));
        Pipeline {
            stages: self.stages,
            chunk_size: self.chunk_size,
            sink: self.sink,
            _types: PhantomData,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Record chunk copy-in and landing times into `sink`.
    pub fn with_profiler(mut self, sink: Arc<dyn TimestampSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

fn record(sink: &Option<Arc<dyn TimestampSink>>, kind: ProfileKind, started: Instant) {
    if let Some(sink) = sink {
        sink.record(ProfileEvent {
            kind,
            device: None,
            duration: started.elapsed(),
        });
    }
}

fn run_stage(stage: &mut dyn ErasedStage, rx: Receiver<Packet>, tx: SyncSender<Packet>) {
    for packet in rx {
        let out = packet.and_then(|(index, chunk)| Ok((index, stage.run(chunk)?)));
        let failed = out.is_err();
        if tx.send(out).is_err() || failed {
            return;
        }
    }
}

impl<I: Element, O: Element> ArrayFunction<I, O> for Pipeline<I, O> {
    fn apply(&mut self, input: &TypedArray<I>) -> Result<TypedArray<O>> {
        if !(MIN_STAGES..=MAX_STAGES).contains(&self.stages.len()) {
            return Err(Error::Pipeline(format!(
                "{} stages; a pipeline runs {MIN_STAGES} to {MAX_STAGES}",
                self.stages.len()
            )));
        }
        let input = input.expanded();
        let len = input.len();
        let chunk = self.chunk_size.min(len).max(1);
        let spans = chunks_of_size(len, chunk)?;
        let mut output = TypedArray::<O>::new(len);
        let sink = self.sink.clone();

        let (first_tx, first_rx) = mpsc::sync_channel::<Packet>(1);
        let landed: Result<()> = thread::scope(|s| {
            // Owned here so an early return closes the channel and unblocks
            // every stage before the scope joins them.
            let mut upstream = first_rx;
            let producer_sink = sink.clone();
            let source = &input;
            s.spawn(move || {
                for (index, span) in spans.iter().enumerate() {
                    let started = Instant::now();
                    let packet = source
                        .slice(span.offset, span.len)
                        .map(|slice| (index, Box::new(slice.to_array()) as Chunk));
                    record(&producer_sink, ProfileKind::Marshal, started);
                    if first_tx.send(packet).is_err() {
                        return;
                    }
                }
            });

            for stage in self.stages.iter_mut() {
                let (tx, rx) = mpsc::sync_channel::<Packet>(1);
                let stage_rx = std::mem::replace(&mut upstream, rx);
                s.spawn(move || run_stage(stage.as_mut(), stage_rx, tx));
            }

            let mut targets = output.split_in_chunks_of_size_mut(chunk)?;
            let mut remaining = targets.len();
            for packet in upstream.iter() {
                let (index, chunk) = packet?;
                let started = Instant::now();
                let array = chunk
                    .downcast::<TypedArray<O>>()
                    .map_err(|_| Error::Pipeline("final chunk does not match output type".into()))?;
                let target = targets
                    .get_mut(index)
                    .ok_or_else(|| Error::Pipeline(format!("unexpected chunk {index}")))?;
                target.copy_from(&array.slice(0, array.len())?)?;
                record(&sink, ProfileKind::Unmarshal, started);
                remaining -= 1;
                if remaining == 0 {
                    break;
                }
            }
            if remaining > 0 {
                return Err(Error::Pipeline(format!("{remaining} chunks never arrived")));
            }
            Ok(())
        });
        landed?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{Map, MapThreads};
    use crate::profiler::Profiler;

    #[test]
    fn two_stage_pipeline_matches_composition() {
        let input = TypedArray::from_fn(1000, |i| i as i32);
        let mut pipeline = Pipeline::new(Map::new(|x: i32| f64::from(x) * 0.5))
            .then(MapThreads::new(|x: f64| (x + 1.0) as i64, 3))
            .with_chunk_size(64);
        assert_eq!(pipeline.stage_count(), 2);
        let out = pipeline.apply(&input).unwrap();
        let expected: Vec<i64> = (0..1000).map(|i| (f64::from(i) * 0.5 + 1.0) as i64).collect();
        assert_eq!(out.to_vec(), expected);
    }

    #[test]
    fn four_stages_over_tuples() {
        let input = TypedArray::from_fn(37, |i| i as i16);
        let mut pipeline = Pipeline::new(Map::new(|x: i16| (x, i32::from(x) * 2)))
            .then(Map::new(|(a, b): (i16, i32)| i64::from(a) + i64::from(b)))
            .then(Map::new(|x: i64| x as f32))
            .then(Map::new(|x: f32| x >= 30.0))
            .with_chunk_size(5);
        let out = pipeline.apply(&input).unwrap();
        assert!(!out.get(9));
        assert!(out.get(10));
    }

    #[test]
    fn single_stage_rejected() {
        let mut pipeline = Pipeline::new(Map::new(|x: i32| x));
        assert!(matches!(pipeline.apply(&TypedArray::new(4)), Err(Error::Pipeline(_))));
    }

    struct Failing;

    impl ArrayFunction<i32, i32> for Failing {
        fn apply(&mut self, input: &TypedArray<i32>) -> Result<TypedArray<i32>> {
            if input.iter().any(|x| x >= 50) {
                return Err(Error::Pipeline("too large".into()));
            }
            Ok(input.clone())
        }
    }

    #[test]
    fn stage_error_stops_pipeline() {
        let input = TypedArray::from_fn(200, |i| i as i32);
        let mut pipeline = Pipeline::new(Map::new(|x: i32| x)).then(Failing).with_chunk_size(10);
        let err = pipeline.apply(&input).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn chunks_are_profiled() {
        let profiler = Arc::new(Profiler::new(true));
        let mut pipeline = Pipeline::new(Map::new(|x: i32| x + 1))
            .then(Map::new(|x: i32| x * 2))
            .with_chunk_size(16)
            .with_profiler(profiler.clone());
        let out = pipeline.apply(&TypedArray::sequence(0, 1, 40)).unwrap();
        assert_eq!(out.get(39), 80);
        assert_eq!(profiler.count(ProfileKind::Marshal), 3);
        assert_eq!(profiler.count(ProfileKind::Unmarshal), 3);
    }
}
