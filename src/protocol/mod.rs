//! # Host wire protocol.
//!
//! Everything that crosses the host pipe lives here, in three layers:
//!
//! - [`frame`] — 2-byte big-endian length framing over the raw pipe
//! - [`term`]  — the tagged-term payload codec (external term format)
//! - [`command`] — `{TransId, Body}` request decoding and reply encoding
//! - [`options`] — spawn option validation, shared by `run`/`shell`/`manage`
//!
//! ## Layering
//! ```text
//! pipe bytes ──► FrameReader ──► term::decode ──► command::decode_request
//! pipe bytes ◄── FrameWriter ◄── term::encode ◄── command::*_reply
//! ```
//!
//! ## Rules
//! - Framing or envelope damage is fatal (the stream position is lost)
//! - Everything inside a command body degrades to one `{error, …}` reply
//! - Replies echo the request's TransId; daemon-originated traffic uses `0`

pub mod command;
pub mod frame;
pub mod options;
pub mod term;

pub use command::{Command, Request};
pub use frame::{FrameReader, FrameWriter};
pub use options::{SpawnOptions, StdioDevice};
