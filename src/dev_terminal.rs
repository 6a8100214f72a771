//! Process-wide singleton "dev" terminal: one shared PTY spawned lazily on
//! the first `/ws/dev` connection and reused by every subsequent one,
//! rather than one PTY per named session as `registry.rs` manages.
//!
//! Concurrent first-connects must converge on a single spawn rather than
//! racing two PTYs into existence; the spawn itself happens while holding
//! the state mutex for exactly that reason.

use crate::pty::{ExitInfo, PtyHandle, PtySpawnConfig};
use crate::registry::HISTORY_LIMIT_BYTES;
use anyhow::Result;
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

const DEV_SHELL_FALLBACKS: &[&str] = &["/bin/zsh", "/bin/bash", "/bin/sh"];
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum DevEvent {
    Output(String),
    Exit(ExitInfo),
    Error(String),
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

struct Live {
    pty: PtyHandle,
    history: Mutex<HistoryBuffer>,
    events: broadcast::Sender<DevEvent>,
}

pub struct DevTerminal {
    live: Mutex<Option<std::sync::Arc<Live>>>,
}

fn probe_cwd() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")))
}

impl DevTerminal {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            live: Mutex::new(None),
        })
    }

    /// Ensures a PTY is running, spawning one if needed. Returns whether
    /// this call spawned a fresh PTY (`true`) or attached to an existing
    /// one (`false`).
    pub async fn spawn_or_attach(self: &std::sync::Arc<Self>) -> Result<bool> {
        let mut guard = self.live.lock().await;
        if let Some(live) = guard.as_ref() {
            if live.pty.is_running().await {
                return Ok(false);
            }
        }

        let shell = PtyHandle::spawn(PtySpawnConfig {
            shell: &crate::pty::detect_shell(DEV_SHELL_FALLBACKS)?,
            args: &[],
            cwd: &probe_cwd(),
            env: &[
                ("TERM".to_string(), "xterm-color".to_string()),
                ("COLORTERM".to_string(), "truecolor".to_string()),
            ],
            cols: 80,
            rows: 24,
        })?;

        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let live = std::sync::Arc::new(Live {
            pty: shell,
            history: Mutex::new(HistoryBuffer::new()),
            events: tx,
        });
        *guard = Some(live.clone());

        tokio::spawn(run_reader(live.clone()));
        tokio::spawn(run_exit_watcher(self.clone(), live));

        Ok(true)
    }

    pub async fn write(&self, data: &[u8]) -> bool {
        let guard = self.live.lock().await;
        match guard.as_ref() {
            Some(live) => {
                let _ = live.pty.write(data).await;
                true
            }
            None => false,
        }
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> bool {
        let guard = self.live.lock().await;
        match guard.as_ref() {
            Some(live) => live.pty.resize(cols, rows).await.is_ok(),
            None => false,
        }
    }

    pub async fn kill(&self) -> bool {
        let mut guard = self.live.lock().await;
        match guard.take() {
            Some(live) => {
                let _ = live.pty.kill().await;
                true
            }
            None => false,
        }
    }

    pub async fn history_snapshot(&self) -> Vec<String> {
        let guard = self.live.lock().await;
        match guard.as_ref() {
            Some(live) => live.history.lock().await.snapshot(),
            None => Vec::new(),
        }
    }

    pub async fn subscribe(&self) -> Option<broadcast::Receiver<DevEvent>> {
        let guard = self.live.lock().await;
        guard.as_ref().map(|live| live.events.subscribe())
    }
}

async fn run_reader(live: std::sync::Arc<Live>) {
    let mut buf = [0u8; 4096];
    loop {
        match live.pty.try_read(&mut buf).await {
            Ok(0) => {
                if !live.pty.is_running().await {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                live.history.lock().await.push(chunk.clone());
                let _ = live.events.send(DevEvent::Output(chunk));
            }
            Err(e) => {
                warn!(error = %e, "dev terminal read failed");
                let _ = live.events.send(DevEvent::Error(e.to_string()));
                break;
            }
        }
    }
}

async fn run_exit_watcher(terminal: std::sync::Arc<DevTerminal>, live: std::sync::Arc<Live>) {
    let info = live.pty.wait_exit().await;
    let _ = live.events.send(DevEvent::Exit(info));
    let mut guard = terminal.live.lock().await;
    if let Some(current) = guard.as_ref() {
        if std::sync::Arc::ptr_eq(current, &live) {
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn first_connect_spawns_second_attaches() {
        let dev = DevTerminal::new();
        assert!(dev.spawn_or_attach().await.unwrap(), "first call must spawn");
        assert!(
            !dev.spawn_or_attach().await.unwrap(),
            "second concurrent connect must attach, not respawn"
        );
        dev.kill().await;
    }

    #[tokio::test]
    async fn write_then_history_accumulates() {
        let dev = DevTerminal::new();
        dev.spawn_or_attach().await.unwrap();
        assert!(dev.write(b"echo hello\n").await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let history = dev.history_snapshot().await;
        let joined: String = history.concat();
        assert!(joined.contains("hello"), "expected echoed output, got {joined:?}");
        dev.kill().await;
    }

    #[tokio::test]
    async fn subscribe_before_spawn_returns_none() {
        let dev = DevTerminal::new();
        assert!(dev.subscribe().await.is_none());
    }

    #[tokio::test]
    async fn two_subscribers_both_observe_output() {
        let dev = DevTerminal::new();
        dev.spawn_or_attach().await.unwrap();
        let mut rx_a = dev.subscribe().await.unwrap();
        let mut rx_b = dev.subscribe().await.unwrap();

        dev.write(b"echo shared\n").await;

        let a = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let DevEvent::Output(data) = rx_a.recv().await.unwrap() {
                    if data.contains("shared") {
                        return;
                    }
                }
            }
        });
        let b = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let DevEvent::Output(data) = rx_b.recv().await.unwrap() {
                    if data.contains("shared") {
                        return;
                    }
                }
            }
        });
        a.await.expect("client a saw shared output");
        b.await.expect("client b saw shared output");
        dev.kill().await;
    }

    #[tokio::test]
    async fn kill_then_spawn_again_starts_a_fresh_pty() {
        let dev = DevTerminal::new();
        dev.spawn_or_attach().await.unwrap();
        assert!(dev.kill().await);
        assert!(!dev.kill().await, "second kill on an empty slot is a no-op");
        assert!(dev.spawn_or_attach().await.unwrap(), "must spawn fresh after kill");
        dev.kill().await;
    }

    #[tokio::test]
    async fn resize_and_write_before_spawn_are_no_ops() {
        let dev = DevTerminal::new();
        assert!(!dev.write(b"x").await);
        assert!(!dev.resize(80, 24).await);
    }
}
