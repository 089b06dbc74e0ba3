//! Bounded output buffer and per-process record

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::domain::types::{OutputLine, OutputStream, ProcessEvent, ProcessHandle, ProcessStatus};

/// Subscriber callback. Returning `false` detaches the subscriber.
pub type OutputCallback = Box<dyn FnMut(&ProcessEvent) -> bool + Send>;

/// Ring buffer of output lines with oldest-first eviction
#[derive(Debug)]
pub struct OutputBuffer {
    lines: VecDeque<OutputLine>,
    capacity: usize,
    next_seq: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            next_seq: 1,
        }
    }

    /// Stamp and append a line, evicting the oldest one at capacity
    pub fn push(&mut self, stream: OutputStream, line: String) -> OutputLine {
        let entry = OutputLine {
            seq: self.next_seq,
            stream,
            line,
            timestamp: Utc::now().timestamp_millis(),
        };
        self.next_seq += 1;

        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(entry.clone());
        entry
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutputLine> {
        self.lines.iter()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Mutable part of a process record, guarded by the record mutex
pub struct RecordState {
    pub buffer: OutputBuffer,
    pub exit_code: Option<i32>,
    pub exited: bool,
    pub exited_at: Option<Instant>,
    subscribers: HashMap<u64, OutputCallback>,
    next_subscriber: u64,
}

impl RecordState {
    fn deliver(&mut self, event: &ProcessEvent) {
        self.subscribers.retain(|_, callback| callback(event));
    }
}

/// A spawned process and everything the runner knows about it
pub struct ProcessRecord {
    pub handle: ProcessHandle,
    pub command: String,
    pub cwd: Option<String>,
    pub started_at: DateTime<Utc>,
    state: Mutex<RecordState>,
    exited_tx: watch::Sender<bool>,
}

impl ProcessRecord {
    pub fn new(handle: ProcessHandle, command: String, cwd: Option<String>, buffer_lines: usize) -> Self {
        Self {
            handle,
            command,
            cwd,
            started_at: Utc::now(),
            state: Mutex::new(RecordState {
                buffer: OutputBuffer::new(buffer_lines),
                exit_code: None,
                exited: false,
                exited_at: None,
                subscribers: HashMap::new(),
                next_subscriber: 0,
            }),
            exited_tx: watch::Sender::new(false),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RecordState> {
        // A panicking subscriber must not wedge the record
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a line and fan it out. Ignored once the record has exited.
    pub fn append(&self, stream: OutputStream, line: String) {
        let mut state = self.lock();
        if state.exited {
            return;
        }
        let entry = state.buffer.push(stream, line);
        state.deliver(&ProcessEvent::Output(entry));
    }

    /// Record the exit code. Returns `false` if exit was already recorded.
    pub fn mark_exited(&self, code: Option<i32>) -> bool {
        let mut state = self.lock();
        if state.exited {
            return false;
        }
        state.exited = true;
        state.exit_code = code;
        state.exited_at = Some(Instant::now());
        state.deliver(&ProcessEvent::Exit { code });
        state.subscribers.clear();
        self.exited_tx.send_replace(true);
        true
    }

    /// Wait until the exit is recorded and return its code
    pub async fn wait_exited(&self) -> Option<i32> {
        let mut exited = self.exited_tx.subscribe();
        // The sender lives as long as `self`, so this only returns once exited
        let _ = exited.wait_for(|exited| *exited).await;
        self.lock().exit_code
    }

    pub fn has_exited(&self) -> bool {
        self.lock().exited
    }

    pub fn status(&self) -> ProcessStatus {
        let state = self.lock();
        if state.exited {
            ProcessStatus::Exited {
                code: state.exit_code,
            }
        } else {
            ProcessStatus::Running {
                pid: self.handle.pid,
            }
        }
    }

    /// Whether the record exited at least `retention` before `now`
    pub fn expired(&self, now: Instant, retention: std::time::Duration) -> bool {
        let state = self.lock();
        match state.exited_at {
            Some(at) => now.saturating_duration_since(at) >= retention,
            None => false,
        }
    }

    pub fn buffered_lines(&self) -> Vec<OutputLine> {
        self.lock().buffer.iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Replay buffered lines to `callback`, then register it for live events.
    ///
    /// Replay and registration happen under one lock acquisition, so no live
    /// line can slip between history and the first live event. A record that
    /// has already exited replays its history and exit, and registers nothing.
    pub fn subscribe(self: &Arc<Self>, mut callback: OutputCallback) -> Unsubscribe {
        let mut state = self.lock();

        for line in state.buffer.iter() {
            if !callback(&ProcessEvent::Output(line.clone())) {
                return Unsubscribe::detached();
            }
        }

        if state.exited {
            callback(&ProcessEvent::Exit {
                code: state.exit_code,
            });
            return Unsubscribe::detached();
        }

        let id = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.insert(id, callback);

        Unsubscribe {
            record: Arc::downgrade(self),
            id: Some(id),
        }
    }
}

/// Handle returned by a subscription. Dropping it unsubscribes.
pub struct Unsubscribe {
    record: Weak<ProcessRecord>,
    id: Option<u64>,
}

impl Unsubscribe {
    fn detached() -> Self {
        Self {
            record: Weak::new(),
            id: None,
        }
    }

    /// Remove the callback. It is never invoked after this returns.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let (Some(id), Some(record)) = (self.id.take(), self.record.upgrade()) {
            record.lock().subscribers.remove(&id);
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.release();
    }
}
