//! Decoding for the PostgreSQL opening handshake.
//!
//! This crate is deliberately narrow: it understands the length-prefixed
//! `StartupMessage`/`SSLRequest`/`GSSENCRequest`/`CancelRequest` family and
//! nothing past it. Once a session is routed to a backend, bytes are
//! spliced through verbatim rather than re-encoded, so there is no general
//! FE/BE message codec here.

mod error;
mod startup;

pub use error::ProtocolError;
pub use startup::{decode_startup, StartupDescriptor, StartupKind, MAX_STARTUP_MESSAGE_LEN};
