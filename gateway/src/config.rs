use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

/// `pg-gateway`: a single-endpoint, multi-tenant PostgreSQL front door.
///
/// Clients connect to one listening port and name whatever database they
/// want in their StartupMessage; it is created on first use against a
/// locally managed PostgreSQL server.
#[derive(Parser, Debug)]
#[command(name = "pg-gateway", version = crate::build_info::VERSION_STRING.as_str())]
pub struct Cli {
    /// Router listen port.
    #[arg(short = 'p', long, default_value_t = 4432)]
    pub listen_port: u16,

    /// Router listen host.
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_host: IpAddr,

    /// Persistent data directory. Ephemeral (temp-dir-backed) if unset.
    #[arg(short = 'D', long)]
    pub data_dir: Option<PathBuf>,

    /// Minimum log level; refined further by RUST_LOG if set.
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Create unknown databases on first connection.
    #[arg(long, action = clap::ArgAction::SetTrue, default_value_t = true, overrides_with = "no_auto_provision")]
    pub auto_provision: bool,

    /// Disables --auto-provision.
    #[arg(long, action = clap::ArgAction::SetTrue, default_value_t = false, overrides_with = "auto_provision")]
    pub no_auto_provision: bool,

    /// Maximum number of simultaneous client sessions.
    #[arg(long, default_value_t = 1000)]
    pub max_connections: usize,

    /// Directory containing the postgres/initdb/pg_ctl binaries. Searches
    /// PATH when unset.
    #[arg(long)]
    pub pg_bin_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// Fully-resolved configuration the rest of the crate consumes. `clap`
/// types never leak past this conversion.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub listen_addr: std::net::SocketAddr,
    pub data_dir: DataDirPolicy,
    pub log_level: &'static str,
    pub auto_provision: bool,
    pub max_connections: usize,
    pub pg_bin_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum DataDirPolicy {
    Persistent(PathBuf),
    Ephemeral,
}

impl TryFrom<Cli> for RouterConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let auto_provision = cli.auto_provision && !cli.no_auto_provision;

        let data_dir = match cli.data_dir {
            Some(path) => {
                let canonical = if path.exists() {
                    path.canonicalize()
                        .with_context(|| format!("canonicalizing data dir {}", path.display()))?
                } else {
                    path
                };
                DataDirPolicy::Persistent(canonical)
            }
            None => DataDirPolicy::Ephemeral,
        };

        if let Some(bin_dir) = &cli.pg_bin_dir {
            anyhow::ensure!(
                bin_dir.is_dir(),
                "--pg-bin-dir {} is not a directory",
                bin_dir.display()
            );
        }

        Ok(RouterConfig {
            listen_addr: std::net::SocketAddr::new(cli.listen_host, cli.listen_port),
            data_dir,
            log_level: cli.log_level.as_str(),
            auto_provision,
            max_connections: cli.max_connections,
            pg_bin_dir: cli.pg_bin_dir,
        })
    }
}
