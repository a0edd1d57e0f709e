//! Small ambient-stack helpers shared by the gateway binary: logging setup,
//! signal handling, and build identification. Deliberately does not carry
//! the rest of the neon `utils` crate's surface (http endpoints, auth
//! tokens, id generation) since the gateway has no use for them.

pub mod build_tag;
pub mod logging;
pub mod signals;
