//! Process service
//!
//! Spawns one-off shell commands, buffers their output and fans every line
//! and the final exit out to subscribers.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::domain::types::{OutputStream, ProcessEvent, ProcessHandle, ProcessStatus};
use crate::error::{Error, Result};
use crate::infra::shell::{resolve_command, shell_command};
use crate::infra::signal::{signal_group, KillSignal};
use crate::service::output::{OutputCallback, ProcessRecord, Unsubscribe};

/// Extra queue room for live events on top of a full replay
const SUBSCRIBER_HEADROOM: usize = 256;

/// Tunables for the process service
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Lines retained per process
    pub buffer_lines: usize,
    /// How long readers may keep draining after the child exits
    pub drain: Duration,
    /// Delay between SIGTERM and SIGKILL
    pub kill_grace: Duration,
    /// How long exited records stay queryable
    pub retention: Duration,
    pub ralph_bin_dir: Option<PathBuf>,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            buffer_lines: 1000,
            drain: Duration::from_millis(500),
            kill_grace: Duration::from_secs(3),
            retention: Duration::from_secs(3600),
            ralph_bin_dir: None,
        }
    }
}

impl ProcessOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            buffer_lines: config.output_buffer_lines,
            drain: config.output_drain(),
            kill_grace: config.kill_grace(),
            retention: config.process_retention(),
            ralph_bin_dir: config.ralph_bin_dir.clone(),
        }
    }
}

/// Process service for executing commands
pub struct ProcessService {
    records: DashMap<String, Arc<ProcessRecord>>,
    options: ProcessOptions,
}

impl ProcessService {
    /// Create a new process service
    pub fn new(options: ProcessOptions) -> Self {
        Self {
            records: DashMap::new(),
            options,
        }
    }

    /// Spawn `command` through the shell and start tracking it
    pub fn start(&self, command: &str, cwd: Option<&str>) -> Result<ProcessHandle> {
        let resolved = resolve_command(command, self.options.ralph_bin_dir.as_deref());

        let mut child = shell_command(&resolved, cwd)
            .spawn()
            .map_err(|e| Error::SpawnFailed(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::SpawnFailed("process exited before reporting a pid".to_string()))?;

        let handle = ProcessHandle {
            id: Uuid::new_v4().to_string(),
            pid,
        };
        let record = Arc::new(ProcessRecord::new(
            handle.clone(),
            command.to_string(),
            cwd.map(str::to_string),
            self.options.buffer_lines,
        ));
        self.records.insert(handle.id.clone(), record.clone());

        info!(
            "Started process {} (pid {}): {}",
            handle.id, handle.pid, resolved
        );

        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump_lines(
                stdout,
                OutputStream::Stdout,
                record.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump_lines(
                stderr,
                OutputStream::Stderr,
                record.clone(),
            )));
        }

        let drain = self.options.drain;
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Failed to wait on process {}: {}", record.handle.id, e);
                    None
                }
            };

            // Grandchildren may hold the pipes open long after the shell is gone
            let aborts: Vec<_> = readers.iter().map(|r| r.abort_handle()).collect();
            if tokio::time::timeout(drain, futures::future::join_all(readers))
                .await
                .is_err()
            {
                debug!(
                    "Output of process {} still open after exit, closing readers",
                    record.handle.id
                );
                for abort in aborts {
                    abort.abort();
                }
            }

            if record.mark_exited(code) {
                info!("Process {} exited with code {:?}", record.handle.id, code);
            }
        });

        Ok(handle)
    }

    /// Current status of a process
    pub fn status(&self, id: &str) -> ProcessStatus {
        match self.records.get(id) {
            Some(record) => record.status(),
            None => ProcessStatus::NotFound,
        }
    }

    /// Look up a tracked record
    pub fn get(&self, id: &str) -> Option<Arc<ProcessRecord>> {
        self.records.get(id).map(|r| r.value().clone())
    }

    /// Terminate a running process.
    ///
    /// Sends SIGTERM to the process group and escalates to SIGKILL if the
    /// process has not exited once the grace period elapses.
    pub fn kill(&self, id: &str) -> Result<()> {
        let record = self
            .get(id)
            .ok_or_else(|| Error::ProcessNotFound(id.to_string()))?;
        if record.has_exited() {
            return Err(Error::ProcessAlreadyExited(id.to_string()));
        }

        let pid = record.handle.pid;
        info!("Killing process {} (pid {})", id, pid);

        if let Err(e) = signal_group(pid, KillSignal::Terminate) {
            warn!("SIGTERM to process {} failed ({}), sending SIGKILL", id, e);
            return signal_group(pid, KillSignal::Kill)
                .map_err(|e| Error::KillFailed(e.to_string()));
        }

        let grace = self.options.kill_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !record.has_exited() {
                warn!(
                    "Process {} still running {:?} after SIGTERM, sending SIGKILL",
                    record.handle.id, grace
                );
                if let Err(e) = signal_group(pid, KillSignal::Kill) {
                    debug!("SIGKILL to process {} failed: {}", record.handle.id, e);
                }
            }
        });

        Ok(())
    }

    /// Register a callback for a process's output.
    ///
    /// Buffered lines are replayed to the callback before this returns.
    pub fn on_output(&self, id: &str, callback: OutputCallback) -> Result<Unsubscribe> {
        let record = self
            .get(id)
            .ok_or_else(|| Error::ProcessNotFound(id.to_string()))?;
        Ok(record.subscribe(callback))
    }

    /// Subscribe through a bounded queue.
    ///
    /// A subscriber that falls a full queue behind is detached from live
    /// output: its stream yields `Lagged`, then the exit once it happens.
    /// Resubscribing replays the buffer.
    pub fn subscribe(&self, id: &str) -> Result<Subscription> {
        let record = self
            .get(id)
            .ok_or_else(|| Error::ProcessNotFound(id.to_string()))?;
        let (tx, rx) = mpsc::channel(self.options.buffer_lines + SUBSCRIBER_HEADROOM);
        let lagged = Arc::new(AtomicBool::new(false));

        let flag = lagged.clone();
        let process_id = id.to_string();
        let unsubscribe = record.subscribe(Box::new(move |event| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                if matches!(event, ProcessEvent::Output(_)) {
                    warn!("Subscriber of process {} fell behind, detaching", process_id);
                    flag.store(true, Ordering::SeqCst);
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }));

        Ok(Subscription::new(Feed {
            rx,
            record,
            lagged,
            finished: false,
            _unsubscribe: unsubscribe,
        }))
    }

    /// Handles of every process that has not exited
    pub fn list_running(&self) -> Vec<ProcessHandle> {
        let mut running: Vec<_> = self
            .records
            .iter()
            .filter(|r| !r.has_exited())
            .map(|r| (r.started_at, r.handle.clone()))
            .collect();
        running.sort_by_key(|(started_at, _)| *started_at);
        running.into_iter().map(|(_, handle)| handle).collect()
    }

    /// Drop records that exited more than the retention period before `now`
    pub fn sweep_exited(&self, now: Instant) -> usize {
        let retention = self.options.retention;
        let before = self.records.len();
        self.records.retain(|_, record| !record.expired(now, retention));
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            info!("Purged {} exited process record(s)", removed);
        }
        removed
    }

    /// Periodically purge exited records
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_exited(Instant::now());
            }
        })
    }
}

/// Read `reader` line by line into the record
async fn pump_lines<R>(reader: R, stream: OutputStream, record: Arc<ProcessRecord>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                record.append(stream, String::from_utf8_lossy(&buf).into_owned());
            }
            Err(e) => {
                debug!(
                    "{} of process {} closed: {}",
                    stream.as_str(),
                    record.handle.id,
                    e
                );
                break;
            }
        }
    }
}

struct Feed {
    rx: mpsc::Receiver<ProcessEvent>,
    record: Arc<ProcessRecord>,
    lagged: Arc<AtomicBool>,
    finished: bool,
    _unsubscribe: Unsubscribe,
}

impl Feed {
    async fn next(mut self) -> Option<(ProcessEvent, Self)> {
        if self.finished {
            return None;
        }
        let event = match self.rx.recv().await {
            Some(event) => event,
            // Detached before the exit was queued
            None if self.lagged.swap(false, Ordering::SeqCst) => ProcessEvent::Lagged,
            None => ProcessEvent::Exit {
                code: self.record.wait_exited().await,
            },
        };
        if matches!(event, ProcessEvent::Exit { .. }) {
            self.finished = true;
        }
        Some((event, self))
    }
}

/// Channel-backed subscription to one process. Dropping it unsubscribes.
///
/// Always ends with exactly one `Exit`.
pub struct Subscription {
    inner: BoxStream<'static, ProcessEvent>,
}

impl Subscription {
    fn new(feed: Feed) -> Self {
        Self {
            inner: stream::unfold(feed, Feed::next).boxed(),
        }
    }

    /// Next event, or `None` after the exit
    pub async fn recv(&mut self) -> Option<ProcessEvent> {
        self.inner.next().await
    }
}

impl Stream for Subscription {
    type Item = ProcessEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
