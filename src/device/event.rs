//! Completion events for asynchronous device operations.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::DeviceError;

type Callback = Box<dyn FnOnce(&EventTiming) + Send>;

/// When an operation was queued and when it finished.
#[derive(Clone, Copy, Debug)]
pub struct EventTiming {
    pub queued: Instant,
    pub completed: Instant,
}

impl EventTiming {
    pub fn duration(&self) -> Duration {
        self.completed.saturating_duration_since(self.queued)
    }
}

enum Status {
    Pending,
    Complete(EventTiming),
    Failed(DeviceError),
}

struct State {
    status: Status,
    queued: Instant,
    payload: Option<Vec<u8>>,
    callbacks: Vec<Callback>,
}

struct Shared {
    state: Mutex<State>,
    ready: Condvar,
}

/// Handle to one queued device operation.
///
/// Reads carry the bytes they fetched as the event payload. Completion
/// callbacks run on whichever thread completes the event, before waiters
/// are released.
#[derive(Clone)]
pub struct Event {
    shared: Arc<Shared>,
}

impl Event {
    pub fn pending() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    status: Status::Pending,
                    queued: Instant::now(),
                    payload: None,
                    callbacks: Vec::new(),
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// An event that is already complete.
    pub fn completed(payload: Option<Vec<u8>>) -> Self {
        let event = Self::pending();
        event.complete(payload);
        event
    }

    pub fn complete(&self, payload: Option<Vec<u8>>) {
        let mut payload = payload;
        loop {
            let (callbacks, timing) = {
                let mut state = self.shared.state.lock();
                if !matches!(state.status, Status::Pending) {
                    return;
                }
                if payload.is_some() {
                    state.payload = payload.take();
                }
                let timing = EventTiming {
                    queued: state.queued,
                    completed: Instant::now(),
                };
                if state.callbacks.is_empty() {
                    state.status = Status::Complete(timing);
                    break;
                }
                (std::mem::take(&mut state.callbacks), timing)
            };
            for callback in callbacks {
                callback(&timing);
            }
        }
        self.shared.ready.notify_all();
    }

    pub fn fail(&self, error: DeviceError) {
        {
            let mut state = self.shared.state.lock();
            if !matches!(state.status, Status::Pending) {
                return;
            }
            state.status = Status::Failed(error);
            state.callbacks.clear();
        }
        self.shared.ready.notify_all();
    }

    /// Run `callback` once the event completes; immediately if it already has.
    /// Callbacks are dropped if the event fails.
    pub fn on_complete(&self, callback: impl FnOnce(&EventTiming) + Send + 'static) {
        let timing = {
            let mut state = self.shared.state.lock();
            let timing = match &state.status {
                Status::Pending => None,
                Status::Complete(timing) => Some(*timing),
                Status::Failed(_) => return,
            };
            match timing {
                Some(timing) => timing,
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&timing);
    }

    pub fn wait(&self) -> Result<EventTiming, DeviceError> {
        let mut state = self.shared.state.lock();
        loop {
            match &state.status {
                Status::Pending => {}
                Status::Complete(timing) => return Ok(*timing),
                Status::Failed(err) => return Err(err.clone()),
            }
            self.shared.ready.wait(&mut state);
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.shared.state.lock().status, Status::Complete(_))
    }

    /// Take the bytes a read produced. `None` for writes and launches.
    pub fn take_payload(&self) -> Option<Vec<u8>> {
        self.shared.state.lock().payload.take()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        let status = match &state.status {
            Status::Pending => "pending",
            Status::Complete(_) => "complete",
            Status::Failed(_) => "failed",
        };
        f.debug_struct("Event").field("status", &status).finish()
    }
}

/// Wait for every event, returning the first failure.
pub fn wait_all(events: &[Event]) -> Result<(), DeviceError> {
    for event in events {
        event.wait()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callbacks_run_before_waiters_wake() {
        let event = Event::pending();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        event.on_complete(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let waiter = {
            let event = event.clone();
            let hits = Arc::clone(&hits);
            std::thread::spawn(move || {
                event.wait().unwrap();
                hits.load(Ordering::SeqCst)
            })
        };
        event.complete(Some(vec![1, 2, 3]));
        assert_eq!(waiter.join().unwrap(), 1);
        assert_eq!(event.take_payload(), Some(vec![1, 2, 3]));
        assert_eq!(event.take_payload(), None);
    }

    #[test]
    fn late_callback_runs_immediately() {
        let event = Event::completed(None);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        event.on_complete(move |t| {
            assert!(t.completed >= t.queued);
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_reaches_waiters() {
        let event = Event::pending();
        event.fail(DeviceError::Execution("reset".into()));
        assert!(event.wait().is_err());
        assert!(!event.is_complete());
        assert!(wait_all(&[Event::completed(None), event]).is_err());
    }
}
