#![forbid(unsafe_code)]

//! External-tool interop: wire codec, event-id translation, and the
//! single-connection TCP server.
//!
//! The wire format is a long-term stable contract with an external
//! closed-source tool; command and parameter names in [`codec`] must not
//! change.

pub mod codec;
pub mod event_map;
pub mod server;

pub use codec::{encode_command, CodecError, Command, CommandDecoder, INTEROP_VERSION};
pub use event_map::EventMap;
pub use server::{start_server, ServerHandle, INTEROP_PORT};
