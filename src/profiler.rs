//! Timing records for offload phases.
//!
//! Components report to a [`TimestampSink`]. [`Profiler`] keeps records in
//! memory when enabled; [`NullSink`] drops them.

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProfileKind {
    /// Whole copy-in phase of one call.
    CopyToDevice,
    /// Kernel preparation: generation, build, buffer allocation.
    ComputeMapPrepare,
    /// Whole launch phase of one call.
    ComputeMap,
    /// Whole copy-out phase of one call.
    CopyToHost,
    WriteBuffer,
    WriteBufferMetadata,
    ReadBuffer,
    Kernel,
    /// Host-side repacking of chunks in a pipeline.
    Marshal,
    Unmarshal,
    /// Host re-execution of the call that deoptimized a function.
    Deopt,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProfileEvent {
    pub kind: ProfileKind,
    pub device: Option<usize>,
    pub duration: Duration,
}

pub trait TimestampSink: Send + Sync {
    fn record(&self, event: ProfileEvent);
}

pub struct NullSink;

impl TimestampSink for NullSink {
    fn record(&self, _event: ProfileEvent) {}
}

#[derive(Default)]
pub struct Profiler {
    enabled: bool,
    events: Mutex<Vec<ProfileEvent>>,
}

impl Profiler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn events(&self) -> Vec<ProfileEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: ProfileKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn total(&self, kind: ProfileKind) -> Duration {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.duration)
            .sum()
    }

    /// Count and total duration per kind.
    pub fn summary(&self) -> BTreeMap<ProfileKind, (usize, Duration)> {
        let mut out = BTreeMap::new();
        for event in self.events.lock().iter() {
            let entry = out.entry(event.kind).or_insert((0, Duration::ZERO));
            entry.0 += 1;
            entry.1 += event.duration;
        }
        out
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl TimestampSink for Profiler {
    fn record(&self, event: ProfileEvent) {
        if self.enabled {
            self.events.lock().push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: ProfileKind, micros: u64) -> ProfileEvent {
        ProfileEvent {
            kind,
            device: Some(0),
            duration: Duration::from_micros(micros),
        }
    }

    #[test]
    fn summary_groups_by_kind() {
        let profiler = Profiler::new(true);
        profiler.record(event(ProfileKind::WriteBuffer, 10));
        profiler.record(event(ProfileKind::WriteBuffer, 5));
        profiler.record(event(ProfileKind::Kernel, 7));
        assert_eq!(profiler.count(ProfileKind::WriteBuffer), 2);
        assert_eq!(profiler.total(ProfileKind::WriteBuffer), Duration::from_micros(15));
        assert_eq!(profiler.summary()[&ProfileKind::Kernel].0, 1);
    }

    #[test]
    fn disabled_profiler_records_nothing() {
        let profiler = Profiler::new(false);
        profiler.record(event(ProfileKind::Deopt, 1));
        assert!(profiler.events().is_empty());
    }
}
