use std::net::SocketAddr;

use thiserror::Error;

pub use pq_proto::ProtocolError as WireError;

/// Errors raised while bringing up or tearing down the embedded backend.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("initdb failed: {0}")]
    InitDbFailed(String),

    #[error("failed to spawn postgres: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("backend did not become ready within {timeout_secs}s; log tail:\n{log_tail}")]
    StartupTimedOut { timeout_secs: u64, log_tail: String },

    #[error("filesystem error preparing data directory {path}: {source}")]
    DataDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend process exited unexpectedly with status {0}")]
    UnexpectedExit(std::process::ExitStatus),
}

/// Errors raised while satisfying `ensure(name)`.
#[derive(Error, Debug, Clone)]
pub enum ProvisionError {
    #[error("CREATE DATABASE \"{name}\" failed: {reason}")]
    CreateFailed { name: String, reason: String },

    #[error("admin channel unavailable: {0}")]
    AdminChannelUnavailable(String),
}

/// Errors local to one client session, never propagated past it.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("could not provision database {database}: {source}")]
    Provision {
        database: String,
        #[source]
        source: ProvisionError,
    },

    #[error("could not reach backend for database {database}: {source}")]
    BackendDial {
        database: String,
        #[source]
        source: std::io::Error,
    },

    #[error("peer error on {addr} while proxying {database}: {source}")]
    Peer {
        addr: SocketAddr,
        database: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection limit of {0} reached")]
    ResourceLimit(usize),
}
