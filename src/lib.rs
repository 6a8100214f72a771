//! clicast-terminal
//!
//! A browser-facing terminal broker: spawns PTY-backed shells per
//! session, brokers their input/output over WebSocket, and exposes a
//! small REST surface for configuration, directory browsing, and
//! session lifecycle.

pub mod config;
pub mod dev_terminal;
pub mod dirs;
pub mod error;
pub mod hub;
pub mod path_guard;
pub mod protocol;
pub mod pty;
pub mod registry;
pub mod security;
pub mod server;
pub mod token_store;

pub use config::Config;
pub use dev_terminal::DevTerminal;
pub use error::AppError;
pub use protocol::{ClientMessage, ServerMessage};
pub use pty::PtyHandle;
pub use registry::{Registry, SessionStatus};
pub use server::{run_server, AppState};
pub use token_store::TokenStore;
