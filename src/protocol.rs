//! WebSocket wire protocol: tagged JSON messages exchanged with the
//! browser client over `/ws` and `/ws/dev`.
//!
//! Both enums are tagged on a `type` field with `rename_all = "lowercase"`,
//! the same pattern this codebase's own WASM terminal bridge uses for its
//! client message set. Serde's generated untagged-variant visitor rejects
//! any `type` value it doesn't recognize, which is what gives us "unknown
//! message types are rejected" for free rather than via a hand-rolled
//! match arm.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Init { cols: u16, rows: u16 },
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Ping,
    /// Dev-terminal-only: request that the shared dev PTY be torn down.
    Kill,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Ready {
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Dev-terminal-only: whether this `ready` spawned a fresh PTY.
        #[serde(rename = "isNew", skip_serializing_if = "Option::is_none")]
        is_new: Option<bool>,
    },
    Output {
        data: String,
    },
    History {
        data: Vec<String>,
    },
    Status {
        status: String,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Exit {
        code: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
    /// Dev-terminal-only: the shared PTY was killed on request.
    Killed,
    Error {
        message: String,
    },
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_init() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"init","cols":80,"rows":24}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Init { cols: 80, rows: 24 }));
    }

    #[test]
    fn parses_input() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"input","data":"ls\n"}"#).unwrap();
        match msg {
            ClientMessage::Input { data } => assert_eq!(data, "ls\n"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rejects_unknown_type() {
        let result: Result<ClientMessage, _> = serde_json::from_str(r#"{"type":"teleport"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn serializes_ready_without_is_new_by_default() {
        let msg = ServerMessage::Ready {
            session_id: "abc".to_string(),
            is_new: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("isNew"));
        assert!(json.contains("\"sessionId\":\"abc\""));
    }

    #[test]
    fn serializes_exit_with_signal() {
        let msg = ServerMessage::Exit {
            code: 0,
            signal: Some(15),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"signal\":15"));
    }

    #[test]
    fn serializes_status() {
        let msg = ServerMessage::Status {
            status: "running".to_string(),
            session_id: "abc".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"status","status":"running","sessionId":"abc"}"#
        );
    }
}
