//! Terminal session service
//!
//! Owns interactive pty sessions. A session can serve several viewers at
//! once, survives its last viewer for a grace period so it can be
//! reattached by id, and ends exactly once: on pty exit, on explicit close,
//! or when the orphan reaper collects it.
//!
//! Output is broadcast verbatim and never buffered; a viewer that attaches
//! late only sees what the pty writes from then on.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use portable_pty::{Child, ChildKiller, MasterPty};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::domain::terminal::{ClientMessage, ConnectParams, ServerMessage, SessionSummary};
use crate::error::{Error, Result};
use crate::infra::pty::{exit_code, pty_size, spawn_pty, PtySpawnOptions};
use crate::infra::signal::{signal_session, KillSignal};

/// Outbound messages queued per viewer before it is considered stalled
pub const VIEWER_QUEUE: usize = 256;

const READ_CHUNK: usize = 4096;

/// How long the exit watcher waits for the reader to flush trailing output
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

pub type ViewerId = u64;

/// Tunables for the terminal service
#[derive(Debug, Clone)]
pub struct TerminalOptions {
    pub shell: String,
    pub max_sessions: usize,
    pub orphan_timeout: Duration,
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            max_sessions: 10,
            orphan_timeout: Duration::from_secs(300),
            cols: 80,
            rows: 24,
        }
    }
}

impl TerminalOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            shell: config.terminal_shell.clone(),
            max_sessions: config.max_terminal_sessions,
            orphan_timeout: config.orphan_timeout(),
            ..Self::default()
        }
    }
}

struct SessionState {
    viewers: HashMap<ViewerId, mpsc::Sender<ServerMessage>>,
    last_access: Instant,
    orphaned_since: Option<Instant>,
    terminated: bool,
}

impl SessionState {
    fn remove_viewer(&mut self, viewer_id: ViewerId) {
        if self.viewers.remove(&viewer_id).is_some() && self.viewers.is_empty() {
            self.orphaned_since = Some(Instant::now());
        }
    }
}

/// A live pty session
pub struct TerminalSession {
    pub id: String,
    pub pid: Option<u32>,
    pub cwd: Option<String>,
    pub label: String,
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    state: Mutex<SessionState>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TerminalSession {
    /// Queue `msg` for one viewer, evicting it if its queue is full
    fn deliver(state: &mut SessionState, viewer_id: ViewerId, msg: ServerMessage) -> bool {
        let Some(tx) = state.viewers.get(&viewer_id) else {
            return false;
        };
        match tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Terminal viewer {} stalled, detaching", viewer_id);
                state.remove_viewer(viewer_id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                state.remove_viewer(viewer_id);
                false
            }
        }
    }

    /// Send `msg` to every attached viewer
    pub fn broadcast(&self, msg: ServerMessage) {
        let mut state = lock(&self.state);
        let ids: Vec<ViewerId> = state.viewers.keys().copied().collect();
        for viewer_id in ids {
            Self::deliver(&mut state, viewer_id, msg.clone());
        }
    }

    /// Send `msg` to a single viewer
    pub fn send_to(&self, viewer_id: ViewerId, msg: ServerMessage) -> bool {
        Self::deliver(&mut lock(&self.state), viewer_id, msg)
    }

    /// Register a viewer and greet it with `ready`.
    ///
    /// Returns `false` if the session has already terminated.
    fn attach(&self, viewer_id: ViewerId, tx: mpsc::Sender<ServerMessage>, reattached: bool) -> bool {
        let mut state = lock(&self.state);
        if state.terminated {
            return false;
        }
        let ready = ServerMessage::Ready {
            pid: self.pid,
            session_id: self.id.clone(),
            reattached,
        };
        if tx.try_send(ready).is_err() {
            return false;
        }
        state.viewers.insert(viewer_id, tx);
        state.orphaned_since = None;
        state.last_access = Instant::now();
        true
    }

    fn detach(&self, viewer_id: ViewerId) {
        lock(&self.state).remove_viewer(viewer_id);
    }

    /// Mark the session terminated. Only the first caller gets `true`.
    fn terminate(&self) -> bool {
        let mut state = lock(&self.state);
        if state.terminated {
            return false;
        }
        state.terminated = true;
        true
    }

    /// Terminate if orphaned for at least `timeout` as of `now`
    fn terminate_if_orphaned(&self, now: Instant, timeout: Duration) -> bool {
        let mut state = lock(&self.state);
        let expired = match state.orphaned_since {
            Some(since) => state.viewers.is_empty() && now.saturating_duration_since(since) >= timeout,
            None => false,
        };
        if !expired || state.terminated {
            return false;
        }
        state.terminated = true;
        true
    }

    /// Drop every viewer sender, which ends their outbound streams
    fn release_viewers(&self) {
        lock(&self.state).viewers.clear();
    }

    /// Kill the shell and everything else running in its session.
    ///
    /// Background jobs hold the pty open, so killing only the shell would
    /// leave the reader blocked.
    fn kill(&self) {
        if let Some(pid) = self.pid {
            match signal_session(pid, KillSignal::Kill) {
                Ok(count) => {
                    debug!("Killed {} process(es) of terminal session {}", count, self.id);
                    return;
                }
                Err(e) => debug!("Failed to signal terminal session {}: {}", self.id, e),
            }
        }
        if let Err(e) = lock(&self.killer).kill() {
            debug!("Failed to kill terminal session {}: {}", self.id, e);
        }
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        {
            let mut writer = lock(&self.writer);
            writer.write_all(data)?;
            writer.flush()?;
        }
        lock(&self.state).last_access = Instant::now();
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        lock(&self.master)
            .resize(pty_size(cols, rows))
            .map_err(|e| Error::Internal(format!("resize failed: {}", e)))
    }

    pub fn viewer_count(&self) -> usize {
        lock(&self.state).viewers.len()
    }

    pub fn last_access(&self) -> Instant {
        lock(&self.state).last_access
    }

    pub fn is_orphaned(&self) -> bool {
        lock(&self.state).orphaned_since.is_some()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            label: self.label.clone(),
            pid: self.pid,
            created_at: self.created_at.to_rfc3339(),
        }
    }
}

/// A viewer's attachment to a session
pub struct Attachment {
    pub session: Arc<TerminalSession>,
    pub viewer_id: ViewerId,
    pub reattached: bool,
}

impl Attachment {
    /// Reply to this viewer only
    pub fn reply(&self, msg: ServerMessage) -> bool {
        self.session.send_to(self.viewer_id, msg)
    }
}

/// Terminal service for managing interactive sessions
pub struct TerminalService {
    sessions: Arc<DashMap<String, Arc<TerminalSession>>>,
    options: TerminalOptions,
    next_viewer: AtomicU64,
    spawn_lock: tokio::sync::Mutex<()>,
}

impl TerminalService {
    /// Create a new terminal service
    pub fn new(options: TerminalOptions) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            options,
            next_viewer: AtomicU64::new(1),
            spawn_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Attach a viewer to an existing session or spawn a new one.
    ///
    /// `tx` becomes the viewer's outbound queue; its first message is `ready`.
    pub async fn connect(
        &self,
        params: &ConnectParams,
        tx: mpsc::Sender<ServerMessage>,
    ) -> Result<Attachment> {
        let viewer_id = self.next_viewer.fetch_add(1, Ordering::Relaxed);

        if let Some(session) = params
            .session_id
            .as_deref()
            .and_then(|id| self.get(id))
        {
            if session.attach(viewer_id, tx.clone(), true) {
                info!(
                    "Viewer {} reattached to terminal session {}",
                    viewer_id, session.id
                );
                return Ok(Attachment {
                    session,
                    viewer_id,
                    reattached: true,
                });
            }
        }

        // Serialize spawns so the capacity check cannot be raced
        let _guard = self.spawn_lock.lock().await;
        if self.sessions.len() >= self.options.max_sessions {
            warn!(
                "Refusing terminal session: {} of {} in use",
                self.sessions.len(),
                self.options.max_sessions
            );
            return Err(Error::MaxSessionsReached(self.options.max_sessions));
        }

        let session = self.spawn_session(params)?;
        if !session.attach(viewer_id, tx, false) {
            return Err(Error::Internal(format!(
                "terminal session {} ended before it could be attached",
                session.id
            )));
        }

        Ok(Attachment {
            session,
            viewer_id,
            reattached: false,
        })
    }

    fn spawn_session(&self, params: &ConnectParams) -> Result<Arc<TerminalSession>> {
        let id = Uuid::new_v4().to_string();
        let label = params
            .label
            .clone()
            .unwrap_or_else(|| format!("Terminal {}", &id[..8]));

        let mut env = vec![("OPSDECK_TERMINAL_LABEL".to_string(), label.clone())];
        if let Some(context) = &params.context {
            env.push(("OPSDECK_TERMINAL_CONTEXT".to_string(), context.clone()));
        }

        let opts = PtySpawnOptions {
            shell: self.options.shell.clone(),
            cwd: params.cwd.clone(),
            cols: params.cols.unwrap_or(self.options.cols),
            rows: params.rows.unwrap_or(self.options.rows),
            env,
        };

        let process = spawn_pty(&opts).map_err(|e| Error::PtyAllocationFailed(e.to_string()))?;

        let session = Arc::new(TerminalSession {
            id: id.clone(),
            pid: process.pid,
            cwd: params.cwd.clone(),
            label,
            context: params.context.clone(),
            created_at: Utc::now(),
            master: Mutex::new(process.master),
            writer: Mutex::new(process.writer),
            killer: Mutex::new(process.killer),
            state: Mutex::new(SessionState {
                viewers: HashMap::new(),
                last_access: Instant::now(),
                orphaned_since: None,
                terminated: false,
            }),
        });
        self.sessions.insert(id.clone(), session.clone());

        info!(
            "Created terminal session {} (pid {:?}) in {:?}",
            id, session.pid, session.cwd
        );

        let reader = spawn_reader(session.clone(), process.reader);
        spawn_exit_watcher(self.sessions.clone(), session.clone(), process.child, reader);

        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    /// Remove a viewer. The session keeps running.
    pub fn detach(&self, attachment: &Attachment) {
        attachment.session.detach(attachment.viewer_id);
        debug!(
            "Viewer {} detached from terminal session {}",
            attachment.viewer_id, attachment.session.id
        );
    }

    pub fn input(&self, session_id: &str, data: &[u8]) -> Result<()> {
        self.get(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?
            .write(data)
    }

    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<()> {
        self.get(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?
            .resize(cols, rows)
    }

    /// Summaries of every live session, oldest first
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|s| s.value().clone()).collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions.iter().map(|s| s.summary()).collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Forcibly end a session. Returns `false` for unknown ids.
    pub fn close(&self, id: &str) -> bool {
        self.close_with(id, |_| {})
    }

    /// Close a session, running `before_release` after viewers were notified
    /// but before their queues are dropped.
    pub fn close_with(&self, id: &str, before_release: impl FnOnce(&TerminalSession)) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        if !session.terminate() {
            return false;
        }

        session.kill();
        session.broadcast(ServerMessage::SessionClosed {
            session_id: session.id.clone(),
        });
        self.sessions.remove(id);
        before_release(&session);
        session.release_viewers();

        info!("Closed terminal session {}", id);
        true
    }

    /// Reap sessions that have had no viewers for the orphan timeout
    pub fn reap_orphans(&self, now: Instant) -> Vec<String> {
        let candidates: Vec<_> = self
            .sessions
            .iter()
            .filter(|s| s.is_orphaned())
            .map(|s| s.value().clone())
            .collect();

        let mut reaped = Vec::new();
        for session in candidates {
            if session.terminate_if_orphaned(now, self.options.orphan_timeout) {
                session.kill();
                self.sessions.remove(&session.id);
                info!("Reaped orphaned terminal session {}", session.id);
                reaped.push(session.id.clone());
            }
        }
        reaped
    }

    /// Periodically reap orphaned sessions
    pub fn spawn_reaper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.reap_orphans(Instant::now());
            }
        })
    }

    /// Parse and dispatch one text frame from a viewer
    pub fn handle_text(&self, attachment: &Attachment, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle_message(attachment, msg),
            Err(e) => {
                debug!("Malformed terminal message from viewer {}: {}", attachment.viewer_id, e);
                attachment.reply(ServerMessage::Error {
                    message: Error::InvalidMessage(e.to_string()).to_string(),
                });
            }
        }
    }

    /// Dispatch one request from a viewer
    pub fn handle_message(&self, attachment: &Attachment, msg: ClientMessage) {
        let session = &attachment.session;
        let outcome = match msg {
            ClientMessage::Input { data } => self.input(&session.id, data.as_bytes()),
            ClientMessage::Resize { cols, rows } => self.resize(&session.id, cols, rows),
            ClientMessage::ListSessions => {
                attachment.reply(ServerMessage::Sessions {
                    sessions: self.list(),
                });
                Ok(())
            }
            ClientMessage::CloseSession { session_id } => {
                let result = |success| ServerMessage::CloseSessionResult {
                    session_id: session_id.clone(),
                    success,
                };
                if session_id == session.id {
                    // Our own queue is dropped on close, so answer before that
                    self.close_with(&session_id, |closed| {
                        closed.send_to(attachment.viewer_id, result(true));
                    });
                } else {
                    let success = self.close(&session_id);
                    attachment.reply(result(success));
                }
                Ok(())
            }
        };

        if let Err(e) = outcome {
            attachment.reply(ServerMessage::Error {
                message: e.to_string(),
            });
        }
    }
}

/// Decodes pty chunks as UTF-8, carrying incomplete trailing sequences over
#[derive(Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let valid_up_to = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                return text;
            }
        };
        let rest = self.pending.split_off(valid_up_to);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        text
    }
}

fn spawn_reader(session: Arc<TerminalSession>, mut reader: Box<dyn Read + Send>) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_CHUNK];
        let mut carry = Utf8Carry::default();
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let data = carry.decode(&buf[..n]);
                    if !data.is_empty() {
                        session.broadcast(ServerMessage::Output { data });
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Terminal session {} reader closed: {}", session.id, e);
                    break;
                }
            }
        }
    })
}

fn spawn_exit_watcher(
    sessions: Arc<DashMap<String, Arc<TerminalSession>>>,
    session: Arc<TerminalSession>,
    mut child: Box<dyn Child + Send + Sync>,
    mut reader: JoinHandle<()>,
) {
    tokio::spawn(async move {
        let status = tokio::task::spawn_blocking(move || child.wait()).await;
        let code = match status {
            Ok(Ok(status)) => exit_code(&status),
            Ok(Err(e)) => {
                warn!("Failed to wait on terminal session {}: {}", session.id, e);
                None
            }
            Err(e) => {
                warn!("Exit watcher for terminal session {} failed: {}", session.id, e);
                None
            }
        };

        // Let trailing output reach viewers before the exit notice
        if tokio::time::timeout(OUTPUT_DRAIN, &mut reader).await.is_err() {
            debug!(
                "Terminal session {} still has processes holding the pty, killing them",
                session.id
            );
            session.kill();
        }

        if session.terminate() {
            session.broadcast(ServerMessage::Exit { code });
            sessions.remove(&session.id);
            session.release_viewers();
            info!("Terminal session {} exited with code {:?}", session.id, code);
        }
    });
}
