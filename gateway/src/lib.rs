//! A single-endpoint, multi-tenant PostgreSQL front door: clients connect
//! to one listening port and name whatever database they want in their
//! StartupMessage; it is created on first use against a locally managed
//! PostgreSQL server, and the connection is then spliced through
//! transparently.

pub mod backend;
pub mod build_info;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod router;
pub mod session;
