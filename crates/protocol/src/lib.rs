//! # ShellMux Protocol Library
//!
//! Wire events, codecs and the journal frame format shared by the ShellMux
//! daemon and its clients.
//!
//! ## Overview
//!
//! - **Events**: [`ClientEvent`] and [`ServerEvent`], tagged by `"type"`
//! - **Codecs**: JSON text frames, or MessagePack [`Envelope`]s in binary frames
//! - **Frame Codec**: length-prefixed frames with optional LZ4 compression,
//!   used for the per-session output journal
//!
//! ## Layering
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        ClientEvent / ServerEvent        │  JSON or MessagePack
//! ├─────────────────────────────────────────┤
//! │               WebSocket                 │  text / binary frames
//! └─────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────┐
//! │         Session output journal          │  <uuid>.log
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  Length-prefixed, LZ4
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientEvent, Codec, FrameCodec};
//!
//! let event = Codec::Json
//!     .decode_text(r#"{"type":"attach-session","session_id":"abc"}"#)
//!     .unwrap();
//! assert_eq!(event.session_id(), Some("abc"));
//!
//! let codec = FrameCodec::new();
//! let frame = codec.encode(b"$ echo hi\r\nhi\r\n").unwrap();
//! assert_eq!(codec.replay(&frame).into_bytes(), b"$ echo hi\r\nhi\r\n");
//! ```

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{
    FrameCodec, FrameFlags, Replay, COMPRESSION_THRESHOLD, FRAME_HEADER_SIZE, FRAME_MAGIC,
    MAX_FRAME_SIZE,
};
pub use messages::{
    ClientEvent, Codec, Encoded, Envelope, ErrorCode, ErrorMessage, ServerEvent, SessionClosed,
    SessionState, SessionSummary, PROTOCOL_VERSION,
};
