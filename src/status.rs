//! Shared per-file delivery status.
//!
//! One record per catalog key, created before the workers start. Each
//! worker only ever touches its own key; the table-wide lock exists for
//! the initial inserts and the final report iteration.

use std::collections::HashMap;
use std::sync::Mutex;

/// Operation a file failed in, for the final report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Stream,
    Put,
    Register,
}

impl Op {
    pub fn tag(&self) -> &'static str {
        match self {
            Op::Stream => "stream",
            Op::Put => "put",
            Op::Register => "register",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepState {
    pub started: bool,
    pub done: bool,
}

/// Delivery state of one file. `cancel` is terminal: once set, no other
/// transition is applied.
#[derive(Debug, Clone, Default)]
pub struct UploadStatus {
    pub cancel: bool,
    pub started: bool,
    pub skipped: bool,
    pub message: String,
    pub failed_op: Option<Op>,
    pub put: StepState,
    pub register: StepState,
}

impl UploadStatus {
    pub fn delivered(&self) -> bool {
        !self.cancel && !self.skipped && self.register.done
    }
}

pub struct StatusTable {
    inner: Mutex<HashMap<String, UploadStatus>>,
}

impl StatusTable {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let map = keys
            .into_iter()
            .map(|k| (k.into(), UploadStatus::default()))
            .collect();
        Self {
            inner: Mutex::new(map),
        }
    }

    fn update<F: FnOnce(&mut UploadStatus)>(&self, key: &str, f: F) {
        let mut map = self.inner.lock().expect("status table poisoned");
        if let Some(status) = map.get_mut(key) {
            if status.cancel || status.skipped {
                return;
            }
            f(status);
        }
    }

    pub fn mark_started(&self, key: &str) {
        self.update(key, |s| s.started = true);
    }

    pub fn mark_put_started(&self, key: &str) {
        self.update(key, |s| s.put.started = true);
    }

    pub fn mark_put_done(&self, key: &str) {
        self.update(key, |s| s.put.done = true);
    }

    pub fn mark_register_started(&self, key: &str) {
        self.update(key, |s| s.register.started = true);
    }

    pub fn mark_register_done(&self, key: &str) {
        self.update(key, |s| s.register.done = true);
    }

    /// Terminal failure for this key. The entry stays in the table with
    /// its reason for the final report. `op` is `None` when the file
    /// never reached an operation (e.g. rejected by the dedup check).
    pub fn fail(&self, key: &str, op: Option<Op>, message: impl Into<String>) {
        self.update(key, |s| {
            s.cancel = true;
            s.failed_op = op;
            s.message = message.into();
        });
    }

    /// Terminal skip (e.g. the object already exists and nothing was
    /// transferred). Not a failure.
    pub fn skip(&self, key: &str, message: impl Into<String>) {
        self.update(key, |s| {
            s.skipped = true;
            s.message = message.into();
        });
    }

    pub fn is_cancelled(&self, key: &str) -> bool {
        let map = self.inner.lock().expect("status table poisoned");
        map.get(key).map(|s| s.cancel).unwrap_or(false)
    }

    /// Clone of the whole table for final reporting.
    pub fn snapshot(&self) -> HashMap<String, UploadStatus> {
        self.inner.lock().expect("status table poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_through_the_full_lifecycle() {
        let table = StatusTable::new(["a.txt"]);
        table.mark_started("a.txt");
        table.mark_put_started("a.txt");
        table.mark_put_done("a.txt");
        table.mark_register_started("a.txt");
        table.mark_register_done("a.txt");

        let snap = table.snapshot();
        let s = &snap["a.txt"];
        assert!(s.started && s.put.done && s.register.done);
        assert!(s.delivered());
        assert!(!s.cancel);
    }

    #[test]
    fn failed_is_terminal() {
        let table = StatusTable::new(["a.txt"]);
        table.mark_started("a.txt");
        table.fail("a.txt", Some(Op::Put), "transport error");

        // Later transitions must not resurrect the entry.
        table.mark_put_done("a.txt");
        table.mark_register_done("a.txt");

        let snap = table.snapshot();
        let s = &snap["a.txt"];
        assert!(s.cancel);
        assert_eq!(s.failed_op, Some(Op::Put));
        assert_eq!(s.message, "transport error");
        assert!(!s.put.done);
        assert!(!s.delivered());
    }

    #[test]
    fn skip_is_terminal_and_not_a_failure() {
        let table = StatusTable::new(["a.txt"]);
        table.skip("a.txt", "already in bucket");
        table.fail("a.txt", Some(Op::Put), "late failure");

        let snap = table.snapshot();
        let s = &snap["a.txt"];
        assert!(s.skipped);
        assert!(!s.cancel);
        assert_eq!(s.message, "already in bucket");
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let table = StatusTable::new(["a.txt"]);
        table.fail("other", Some(Op::Register), "nope");
        assert!(!table.is_cancelled("other"));
        assert_eq!(table.snapshot().len(), 1);
    }
}
