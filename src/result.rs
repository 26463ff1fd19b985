//! The uniform result envelope, progress events, and operation status
//! lifecycle (`spec.md` §3, §4.7).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;

/// Discriminated outcome of a fallible operation. Always carries a
/// human-readable `message`, separate from `Error`'s own message, because a
/// successful operation has something worth telling the user too (e.g. "4
/// MiB verified OK").
#[derive(Debug)]
pub enum OperationResult<T> {
    Ok { value: Option<T>, message: String },
    Err(Error),
}

impl<T> OperationResult<T> {
    pub fn ok(value: T, message: impl Into<String>) -> Self {
        OperationResult::Ok {
            value: Some(value),
            message: message.into(),
        }
    }

    pub fn ok_unit(message: impl Into<String>) -> Self {
        OperationResult::Ok {
            value: None,
            message: message.into(),
        }
    }

    pub fn err(error: Error) -> Self {
        OperationResult::Err(error)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, OperationResult::Ok { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            OperationResult::Ok { message, .. } => message,
            OperationResult::Err(e) => &e.message,
        }
    }

    /// Converts into a plain `std::result::Result`, discarding the success
    /// message. Convenient at call sites that only care about the value.
    pub fn into_result(self) -> Result<Option<T>, Error> {
        match self {
            OperationResult::Ok { value, .. } => Ok(value),
            OperationResult::Err(e) => Err(e),
        }
    }
}

impl<T> From<Result<T, Error>> for OperationResult<T> {
    fn from(r: Result<T, Error>) -> Self {
        match r {
            Ok(v) => OperationResult::ok(v, "ok"),
            Err(e) => OperationResult::err(e),
        }
    }
}

/// A single progress update for one in-flight operation.
///
/// `current_bytes` is monotone non-decreasing within one operation and
/// terminates at `total_bytes` (`spec.md` §8, property 3).
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    pub operation_name: String,
    pub current_bytes: u64,
    pub total_bytes: u64,
    pub elapsed: Duration,
    pub message: String,
}

impl ProgressInfo {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.current_bytes as f64 / self.total_bytes as f64) * 100.0
        }
    }

    pub fn speed_bytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.current_bytes as f64 / secs
        }
    }
}

impl fmt::Display for ProgressInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} bytes ({:.1}%) — {}",
            self.operation_name,
            self.current_bytes,
            self.total_bytes,
            self.percent(),
            self.message
        )
    }
}

/// The operation status state machine: `Idle -> Running -> (Completed |
/// Failed | Cancelled) -> Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A sink for progress events, implemented directly by [`Observers`] and by
/// the orchestrator's band remapper so a multi-phase operation can report
/// one contiguous `0..100%` sequence instead of each phase restarting at
/// `0` (`spec.md` §4.6, §8 property 3).
pub trait ProgressSink {
    fn emit_progress(&self, operation_name: &str, current: u64, total: u64, message: &str);
}

/// Observer registration: a list of progress/status callbacks plus helpers
/// to emit one progress event and the single terminal status event every
/// operation is guaranteed to produce (`spec.md` §4.7).
///
/// No global event bus: a `Session` owns one `Observers` and callers
/// register directly on it.
pub struct Observers {
    progress: Mutex<Vec<(u64, Box<dyn FnMut(&ProgressInfo) + Send>)>>,
    status: Mutex<Vec<(u64, Box<dyn FnMut(OperationStatus) + Send>)>>,
    next_id: std::sync::atomic::AtomicU64,
    status_state: Mutex<OperationStatus>,
    started_at: Mutex<Option<Instant>>,
}

/// An opaque handle returned by `subscribe_*`, passed back to `unsubscribe_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

impl Default for Observers {
    fn default() -> Self {
        Self::new()
    }
}

impl Observers {
    pub fn new() -> Self {
        Self {
            progress: Mutex::new(Vec::new()),
            status: Mutex::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU64::new(0),
            status_state: Mutex::new(OperationStatus::Idle),
            started_at: Mutex::new(None),
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn subscribe_progress(
        &self,
        callback: impl FnMut(&ProgressInfo) + Send + 'static,
    ) -> SubscriptionId {
        let id = self.allocate_id();
        self.progress.lock().unwrap().push((id, Box::new(callback)));
        SubscriptionId(id)
    }

    pub fn subscribe_status(
        &self,
        callback: impl FnMut(OperationStatus) + Send + 'static,
    ) -> SubscriptionId {
        let id = self.allocate_id();
        self.status.lock().unwrap().push((id, Box::new(callback)));
        SubscriptionId(id)
    }

    pub fn unsubscribe_progress(&self, id: SubscriptionId) {
        self.progress.lock().unwrap().retain(|(i, _)| *i != id.0);
    }

    pub fn unsubscribe_status(&self, id: SubscriptionId) {
        self.status.lock().unwrap().retain(|(i, _)| *i != id.0);
    }

    pub fn current_status(&self) -> OperationStatus {
        *self.status_state.lock().unwrap()
    }

    /// Transitions `Idle -> Running`, recording the start time used to
    /// compute `ProgressInfo::elapsed`.
    pub fn begin(&self) {
        *self.started_at.lock().unwrap() = Some(Instant::now());
        self.set_status(OperationStatus::Running);
    }

    pub fn emit_progress(&self, operation_name: &str, current: u64, total: u64, message: &str) {
        let elapsed = self
            .started_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let info = ProgressInfo {
            operation_name: operation_name.to_string(),
            current_bytes: current,
            total_bytes: total,
            elapsed,
            message: message.to_string(),
        };
        for (_, cb) in self.progress.lock().unwrap().iter_mut() {
            cb(&info);
        }
    }

    /// Ends the operation with a terminal status. Exactly one of these is
    /// ever delivered per `begin()`, and it always arrives after every
    /// progress event for that operation (`spec.md` §8, property 4).
    pub fn finish(&self, terminal: OperationStatus) {
        debug_assert!(matches!(
            terminal,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        ));
        self.set_status(terminal);
        self.set_status(OperationStatus::Idle);
    }

    fn set_status(&self, status: OperationStatus) {
        *self.status_state.lock().unwrap() = status;
        for (_, cb) in self.status.lock().unwrap().iter_mut() {
            cb(status);
        }
    }
}

impl ProgressSink for Observers {
    fn emit_progress(&self, operation_name: &str, current: u64, total: u64, message: &str) {
        Observers::emit_progress(self, operation_name, current, total, message)
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("status", &self.current_status())
            .finish_non_exhaustive()
    }
}

/// A cooperative cancellation token, scoped to one operation. Checked at
/// every suspension point (`spec.md` §5): chunk boundaries, busy-poll
/// sleeps, per-page writes.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::cancelled())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn progress_is_monotone_and_terminates() {
        let obs = Observers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        obs.subscribe_progress(move |p| seen2.lock().unwrap().push(p.current_bytes));
        obs.begin();
        obs.emit_progress("read", 0, 100, "start");
        obs.emit_progress("read", 50, 100, "half");
        obs.emit_progress("read", 100, 100, "done");
        obs.finish(OperationStatus::Completed);

        let values = seen.lock().unwrap();
        assert_eq!(&*values, &[0, 50, 100]);
        assert_eq!(*values.last().unwrap(), 100);
    }

    #[test]
    fn exactly_one_terminal_status_after_progress() {
        let obs = Observers::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let order2 = order.clone();
        obs.subscribe_progress(move |_| order2.lock().unwrap().push("progress"));
        let order3 = order.clone();
        obs.subscribe_status(move |s| order3.lock().unwrap().push(match s {
            OperationStatus::Idle => "idle",
            OperationStatus::Running => "running",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        }));
        obs.begin();
        obs.emit_progress("op", 1, 2, "");
        obs.finish(OperationStatus::Completed);

        let log = order.lock().unwrap();
        assert_eq!(&*log, &["running", "progress", "completed", "idle"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let obs = Observers::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let id = obs.subscribe_progress(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        obs.begin();
        obs.emit_progress("op", 0, 1, "");
        obs.unsubscribe_progress(id);
        obs.emit_progress("op", 1, 1, "");
        obs.finish(OperationStatus::Completed);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancellation_token_is_observed() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(token.check().is_err());
    }
}
