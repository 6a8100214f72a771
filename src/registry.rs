//! In-memory session registry: owns every live PTY, the output history
//! ring per session, and the idle reaper.
//!
//! The map itself is a `DashMap` (the lock-free map this codebase already
//! reaches for when many tasks touch many independent entries
//! concurrently), while the one piece of state genuinely shared across an
//! entry's lifetime — status, last-activity, history, the PTY handle
//! itself — lives behind its own `tokio::sync::Mutex` inside each entry.
//! Events fan out through a `broadcast` channel per session: the
//! reader/exit-watcher tasks publish through the `SessionCallbacks`
//! handle, and every connected WebSocket client subscribes its own
//! receiver.
//!
//! `create` and `start` are deliberately separate operations, matching
//! the source contract: `create` only registers a pending record (no
//! PTY, no child process); the PTY is spawned by `start`, which the hub
//! calls once a client's first `init` message supplies the terminal
//! dimensions.

use crate::pty::{ExitInfo, PtyHandle, PtySpawnConfig};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

pub const HISTORY_LIMIT_BYTES: usize = 100 * 1024;
const REAPER_PERIOD: Duration = Duration::from_secs(30);
const IDLE_THRESHOLD: Duration = Duration::from_secs(30 * 60);
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// `created | running | exited | terminated` — exactly the four states
/// the data model allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Running,
    Exited,
    Terminated,
}

impl SessionStatus {
    pub fn as_wire(self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Running => "running",
            SessionStatus::Exited => "exited",
            SessionStatus::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Output(String),
    Status(SessionStatus),
    Exit(ExitInfo),
    Error(String),
}

/// The callback-shaped publish side of a session's event channel: the
/// reader and exit-watcher tasks call `on_output`/`on_status`/`on_exit`/
/// `on_error` exactly as if invoking user-supplied callbacks; under the
/// hood each call publishes onto a shared broadcast channel that every
/// connected client subscribes to independently.
#[derive(Clone)]
pub struct SessionCallbacks {
    tx: broadcast::Sender<SessionEvent>,
}

impl SessionCallbacks {
    fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn on_output(&self, data: String) {
        let _ = self.tx.send(SessionEvent::Output(data));
    }

    pub fn on_status(&self, status: SessionStatus) {
        let _ = self.tx.send(SessionEvent::Status(status));
    }

    pub fn on_exit(&self, info: ExitInfo) {
        let _ = self.tx.send(SessionEvent::Exit(info));
    }

    pub fn on_error(&self, message: String) {
        let _ = self.tx.send(SessionEvent::Error(message));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

struct HistoryBuffer {
    chunks: VecDeque<String>,
    total_bytes: usize,
}

impl HistoryBuffer {
    fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
        }
    }

    fn push(&mut self, chunk: String) {
        self.total_bytes += chunk.len();
        self.chunks.push_back(chunk);
        while self.total_bytes > HISTORY_LIMIT_BYTES {
            match self.chunks.pop_front() {
                Some(front) => self.total_bytes -= front.len(),
                None => break,
            }
        }
    }

    fn snapshot(&self) -> Vec<String> {
        self.chunks.iter().cloned().collect()
    }
}

pub struct SessionEntry {
    pub id: Uuid,
    pub working_dir: PathBuf,
    pub ai_command: String,
    pub created_at: Instant,
    status: Mutex<SessionStatus>,
    last_activity: Mutex<Instant>,
    /// `None` until `start` spawns it; cleared again once the session
    /// reaches a terminal status (invariant: `status=running ⇔ pty ≠ null`).
    pty: Mutex<Option<PtyHandle>>,
    spawn_error: Mutex<Option<String>>,
    history: Mutex<HistoryBuffer>,
    callbacks: SessionCallbacks,
}

impl SessionEntry {
    pub async fn status(&self) -> SessionStatus {
        *self.status.lock().await
    }

    pub async fn last_activity(&self) -> Instant {
        *self.last_activity.lock().await
    }

    pub async fn spawn_error(&self) -> Option<String> {
        self.spawn_error.lock().await.clone()
    }

    pub fn callbacks(&self) -> SessionCallbacks {
        self.callbacks.clone()
    }

    pub async fn history_snapshot(&self) -> Vec<String> {
        self.history.lock().await.snapshot()
    }

    async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    async fn set_status(&self, status: SessionStatus) {
        *self.status.lock().await = status;
    }
}

/// Splits `--workdir <dir>` out of an AI command string, returning the
/// remaining command (falling back to `claude` if nothing is left) and
/// the working directory override, if any.
fn resolve_command(ai_command: &str, default_cwd: &Path) -> (String, PathBuf) {
    let trimmed = ai_command.trim();
    let Some(idx) = trimmed.find("--workdir") else {
        let command = if trimmed.is_empty() {
            "claude".to_string()
        } else {
            trimmed.to_string()
        };
        return (command, default_cwd.to_path_buf());
    };

    let before = &trimmed[..idx];
    let after = trimmed[idx + "--workdir".len()..].trim_start();
    let (dir, rest) = match after.find(char::is_whitespace) {
        Some(end) => (&after[..end], &after[end..]),
        None => (after, ""),
    };

    let mut command = format!("{before} {rest}").trim().to_string();
    if command.is_empty() {
        command = "claude".to_string();
    }
    let cwd = if dir.is_empty() {
        default_cwd.to_path_buf()
    } else {
        PathBuf::from(dir)
    };
    (command, cwd)
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', "'\\''"))
}

pub struct Registry {
    sessions: dashmap::DashMap<Uuid, Arc<SessionEntry>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: dashmap::DashMap::new(),
            reaper: Mutex::new(None),
        })
    }

    pub fn exists(&self, id: Uuid) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<SessionEntry>> {
        self.sessions.get(&id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<Arc<SessionEntry>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Registers a new pending session record. Does **not** spawn a PTY —
    /// that only happens once a client's `init` reaches [`Registry::start`].
    pub fn create(self: &Arc<Self>, working_dir: PathBuf, ai_command: String) -> Uuid {
        let id = Uuid::new_v4();
        let entry = Arc::new(SessionEntry {
            id,
            working_dir,
            ai_command,
            created_at: Instant::now(),
            status: Mutex::new(SessionStatus::Created),
            last_activity: Mutex::new(Instant::now()),
            pty: Mutex::new(None),
            spawn_error: Mutex::new(None),
            history: Mutex::new(HistoryBuffer::new()),
            callbacks: SessionCallbacks::new(),
        });
        self.sessions.insert(id, entry);
        self.ensure_reaper_running();
        id
    }

    /// Spawns the session's PTY at the given dimensions if it has none
    /// yet; idempotent on subsequent calls. Returns `false` only when `id`
    /// does not name a registered session.
    pub async fn start(self: &Arc<Self>, id: Uuid, cols: u16, rows: u16) -> bool {
        let Some(entry) = self.get(id) else { return false };

        let mut pty_guard = entry.pty.lock().await;
        if pty_guard.is_some() {
            return true;
        }
        if entry.status().await != SessionStatus::Created {
            // Already reached a terminal status (e.g. stopped before the
            // first client ever connected) — nothing to spawn.
            return true;
        }

        let (command, cwd) = resolve_command(&entry.ai_command, &entry.working_dir);
        let shell_line = format!("cd {} && {}", shell_quote(&cwd), command);
        let env = [
            ("TERM".to_string(), "xterm-color".to_string()),
            ("COLORTERM".to_string(), "truecolor".to_string()),
        ];
        let spawn_config = PtySpawnConfig {
            shell: "bash",
            args: &["-c".to_string(), shell_line],
            cwd: &entry.working_dir,
            env: &env,
            cols,
            rows,
        };

        match PtyHandle::spawn(spawn_config) {
            Ok(handle) => {
                *pty_guard = Some(handle);
                drop(pty_guard);
                entry.set_status(SessionStatus::Running).await;
                entry.callbacks.on_status(SessionStatus::Running);
                tokio::spawn(run_reader(entry.clone()));
                tokio::spawn(run_exit_watcher(entry));
            }
            Err(e) => {
                drop(pty_guard);
                warn!(session_id = %id, error = %e, "failed to spawn session PTY");
                *entry.spawn_error.lock().await = Some(e.to_string());
                entry.set_status(SessionStatus::Exited).await;
                entry.callbacks.on_error(e.to_string());
                entry.callbacks.on_status(SessionStatus::Exited);
            }
        }
        true
    }

    pub async fn write(&self, id: Uuid, data: &[u8]) -> bool {
        let Some(entry) = self.get(id) else { return false };
        let pty = entry.pty.lock().await.clone();
        match pty {
            Some(pty) => {
                entry.touch().await;
                let _ = pty.write(data).await;
                true
            }
            None => false,
        }
    }

    pub async fn resize(&self, id: Uuid, cols: u16, rows: u16) -> bool {
        let Some(entry) = self.get(id) else { return false };
        let pty = entry.pty.lock().await.clone();
        match pty {
            Some(pty) => {
                entry.touch().await;
                pty.resize(cols, rows).await.is_ok()
            }
            None => false,
        }
    }

    /// Kills the PTY (if any) and transitions to `terminated`. Idempotent.
    pub async fn terminate(&self, id: Uuid) -> bool {
        let Some(entry) = self.get(id) else { return false };

        // Status is flipped to `Terminated` while still holding the `pty`
        // lock, before the kill is issued, so `run_exit_watcher`'s own
        // status check (see below) is guaranteed to observe it once the
        // kill causes that task's `wait_exit` to resolve. Without this
        // ordering the watcher can read the pre-kill status, race the
        // write below, and overwrite it with `Exited`.
        let mut pty_guard = entry.pty.lock().await;
        if *entry.status.lock().await == SessionStatus::Terminated {
            return true;
        }
        *entry.status.lock().await = SessionStatus::Terminated;
        let pty = pty_guard.take();
        drop(pty_guard);

        entry.callbacks.on_status(SessionStatus::Terminated);
        if let Some(pty) = pty {
            let _ = pty.kill().await;
        }
        true
    }

    /// Terminates (if not already terminal) and removes the record.
    /// Matches §4.4's literal composition: `delete` always kills any live
    /// PTY first, so no caller can leak a running child by calling
    /// `delete` without a preceding `terminate`.
    pub async fn delete(&self, id: Uuid) -> bool {
        self.terminate(id).await;
        self.sessions.remove(&id).is_some()
    }

    pub async fn history(&self, id: Uuid) -> Option<Vec<String>> {
        let entry = self.get(id)?;
        Some(entry.history_snapshot().await)
    }

    fn ensure_reaper_running(self: &Arc<Self>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut guard = registry.reaper.lock().await;
            if guard.is_some() {
                return;
            }
            let reaper_registry = registry.clone();
            *guard = Some(tokio::spawn(async move {
                run_reaper(reaper_registry).await;
            }));
        });
    }

    async fn stop_reaper_if_empty(self: &Arc<Self>) {
        if !self.sessions.is_empty() {
            return;
        }
        if let Some(handle) = self.reaper.lock().await.take() {
            handle.abort();
        }
    }
}

async fn run_reader(entry: Arc<SessionEntry>) {
    let pty = { entry.pty.lock().await.clone() };
    let Some(pty) = pty else { return };
    let mut buf = [0u8; 4096];
    loop {
        match pty.try_read(&mut buf).await {
            Ok(0) => {
                if !pty.is_running().await {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                entry.touch().await;
                entry.history.lock().await.push(chunk.clone());
                entry.callbacks.on_output(chunk);
            }
            Err(e) => {
                entry.callbacks.on_error(e.to_string());
                break;
            }
        }
    }
}

async fn run_exit_watcher(entry: Arc<SessionEntry>) {
    let pty = { entry.pty.lock().await.clone() };
    let Some(pty) = pty else { return };
    let info = pty.wait_exit().await;

    // `terminate()` may have already run for this session (it sets
    // `Terminated` before killing the PTY, which is what unblocks
    // `wait_exit` above). If so, its transition wins and this natural-exit
    // detection is a no-op — mirroring the `ptr_eq` guard `DevTerminal`'s
    // own exit watcher uses against the same class of race.
    let mut pty_guard = entry.pty.lock().await;
    if *entry.status.lock().await == SessionStatus::Terminated {
        return;
    }
    *pty_guard = None;
    drop(pty_guard);
    entry.set_status(SessionStatus::Exited).await;
    entry.callbacks.on_status(SessionStatus::Exited);
    entry.callbacks.on_exit(info);
}

async fn run_reaper(registry: Arc<Registry>) {
    let mut ticker = tokio::time::interval(REAPER_PERIOD);
    loop {
        ticker.tick().await;
        reap_idle_sessions(&registry).await;
        registry.stop_reaper_if_empty().await;
        if registry.sessions.is_empty() {
            break;
        }
    }
}

/// A single reaper sweep, factored out so tests can exercise it directly
/// against a backdated `last_activity` rather than sleeping 30 minutes.
async fn reap_idle_sessions(registry: &Arc<Registry>) -> usize {
    let mut reaped = 0;
    for entry in registry.list() {
        if entry.status().await != SessionStatus::Running {
            continue;
        }
        if entry.last_activity().await.elapsed() < IDLE_THRESHOLD {
            continue;
        }
        registry.terminate(entry.id).await;
        reaped += 1;
    }
    if reaped > 0 {
        info!(count = reaped, "idle reaper terminated sessions");
    }
    reaped
}
