//! Wire events exchanged between ShellMux clients and the daemon.
//!
//! Events are tagged by a `"type"` field using the kebab-case names the web
//! client speaks (`create-session`, `terminal-output`, ...). Browsers use JSON
//! text frames; native clients may opt into MessagePack binary frames wrapped
//! in a versioned [`Envelope`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Events sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Spawn a new shell session owned by this connection.
    CreateSession {
        /// Requested columns; the daemon default applies when absent.
        #[serde(default)]
        cols: Option<u16>,
        /// Requested rows; the daemon default applies when absent.
        #[serde(default)]
        rows: Option<u16>,
    },
    /// Take ownership of an existing session and receive its log.
    AttachSession { session_id: String },
    /// Keystrokes for a session owned by this connection.
    TerminalInput {
        session_id: String,
        #[serde(with = "wire_bytes")]
        data: Vec<u8>,
    },
    /// Terminal window size change.
    ResizeTerminal {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    /// Kill the session and delete its log.
    CloseSession { session_id: String },
    /// Request a `sessions-list` reply.
    GetSessions {
        /// List every session instead of only this connection's.
        #[serde(default)]
        all: bool,
    },
    /// Keepalive check.
    Ping {
        #[serde(default)]
        timestamp: u64,
    },
}

impl ClientEvent {
    /// Session this event targets, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ClientEvent::AttachSession { session_id }
            | ClientEvent::TerminalInput { session_id, .. }
            | ClientEvent::ResizeTerminal { session_id, .. }
            | ClientEvent::CloseSession { session_id } => Some(session_id),
            ClientEvent::CreateSession { .. }
            | ClientEvent::GetSessions { .. }
            | ClientEvent::Ping { .. } => None,
        }
    }

    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::CreateSession { .. } => "create-session",
            ClientEvent::AttachSession { .. } => "attach-session",
            ClientEvent::TerminalInput { .. } => "terminal-input",
            ClientEvent::ResizeTerminal { .. } => "resize-terminal",
            ClientEvent::CloseSession { .. } => "close-session",
            ClientEvent::GetSessions { .. } => "get-sessions",
            ClientEvent::Ping { .. } => "ping",
        }
    }
}

/// Events sent by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// A session was created and is owned by the receiving connection.
    SessionCreated { session_id: String },
    /// The receiving connection now owns the session. `log` is the whole
    /// retained output, sent before any further live output.
    SessionAttached {
        session_id: String,
        #[serde(with = "wire_bytes")]
        log: Vec<u8>,
    },
    /// Live output from a session owned by the receiving connection.
    TerminalOutput {
        session_id: String,
        #[serde(with = "wire_bytes")]
        data: Vec<u8>,
    },
    /// The session's process is gone.
    SessionClosed(SessionClosed),
    /// Reply to `get-sessions`.
    SessionsList { sessions: Vec<SessionSummary> },
    /// A request failed.
    Error(ErrorMessage),
    /// Reply to `ping`.
    Pong { timestamp: u64 },
}

impl ServerEvent {
    /// Build an error event.
    pub fn error(code: ErrorCode, message: impl Into<String>, session_id: Option<String>) -> Self {
        ServerEvent::Error(ErrorMessage {
            recoverable: code.is_recoverable(),
            code,
            message: message.into(),
            session_id,
        })
    }
}

/// Session closed notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClosed {
    /// Session ID that was closed.
    pub session_id: String,
    /// Exit code if the process exited normally.
    #[serde(default)]
    pub exit_code: Option<u32>,
    /// Signal name if the process was killed by a signal.
    #[serde(default)]
    pub signal: Option<String>,
    /// Human-readable reason for closure.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Lifecycle state of a session as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    /// Backend running, owned by a connection.
    Active,
    /// Backend running, no owner.
    Detached,
    /// Backend gone, log retained.
    Closed,
    /// Log deleted; never listed.
    Terminated,
}

impl SessionState {
    /// Whether a backend process is expected to be alive in this state.
    pub fn has_backend(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Detached)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Active => "active",
            SessionState::Detached => "detached",
            SessionState::Closed => "closed",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// One entry of a `sessions-list` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: u64,
    pub state: SessionState,
}

/// Error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Session the failed request referred to.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Whether the client can keep using the connection as-is.
    pub recoverable: bool,
}

/// Stable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// The OS refused to spawn the shell.
    SpawnError,
    /// Another connection owns the session.
    OwnershipConflict,
    /// No such session.
    UnknownSession,
    /// The session's process already exited.
    BackendClosed,
    /// The durable log could not be written.
    StoreIo,
    /// The configured session limit was reached.
    SessionLimit,
    /// The frame could not be decoded or the request is not allowed here.
    InvalidRequest,
    /// The connection is not permitted.
    Unauthorized,
    /// Server-side error.
    Internal,
}

impl ErrorCode {
    /// Whether the error leaves the connection usable.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, ErrorCode::Unauthorized | ErrorCode::Internal)
    }
}

/// Envelope wrapper for MessagePack frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Per-connection sequence number.
    pub sequence: u64,
    /// The wrapped event.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Create a new envelope with the current protocol version.
    pub fn new(sequence: u64, payload: T) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence,
            payload,
        }
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serialize the envelope to MessagePack bytes.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Deserialize an envelope, rejecting versions this build cannot read.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        let envelope: Self = rmp_serde::from_slice(bytes)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope)
    }
}

/// Frame encoding negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// JSON text frames.
    #[default]
    Json,
    /// MessagePack [`Envelope`]s in binary frames.
    MessagePack,
}

/// An encoded outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    Text(String),
    Binary(Vec<u8>),
}

impl Codec {
    /// Pick the codec from a URL query string (`codec=msgpack`).
    pub fn from_query(query: Option<&str>) -> Self {
        let wants_msgpack = query
            .into_iter()
            .flat_map(|q| q.split('&'))
            .filter_map(|pair| pair.split_once('='))
            .any(|(key, value)| key == "codec" && (value == "msgpack" || value == "messagepack"));

        if wants_msgpack {
            Codec::MessagePack
        } else {
            Codec::Json
        }
    }

    /// Encode an outbound event.
    pub fn encode(&self, event: &ServerEvent, sequence: u64) -> Result<Encoded> {
        match self {
            Codec::Json => Ok(Encoded::Text(serde_json::to_string(event)?)),
            Codec::MessagePack => Ok(Encoded::Binary(
                Envelope::new(sequence, event).to_msgpack()?,
            )),
        }
    }

    /// Decode an inbound text frame. Text is always JSON.
    pub fn decode_text(&self, text: &str) -> Result<ClientEvent> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decode an inbound binary frame.
    pub fn decode_binary(&self, bytes: &[u8]) -> Result<ClientEvent> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::MessagePack => Ok(Envelope::<ClientEvent>::from_msgpack(bytes)?.payload),
        }
    }
}

/// Byte payloads: base64 strings for human-readable formats, raw binary
/// otherwise. Decoding accepts either shape.
mod wire_bytes {
    use std::fmt;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&STANDARD.encode(bytes))
        } else {
            serde_bytes::serialize(bytes, serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        deserializer.deserialize_any(BytesVisitor)
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a base64 string or a byte array")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            STANDARD.decode(v).map_err(E::custom)
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element::<u8>()? {
                out.push(byte);
            }
            Ok(out)
        }
    }
}
