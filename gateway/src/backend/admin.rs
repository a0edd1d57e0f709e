use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_postgres::error::SqlState;
use tracing::{error, warn};

use crate::error::ProvisionError;

const ADMIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const ALREADY_EXISTS_STATES: [&SqlState; 2] = [&SqlState::DUPLICATE_DATABASE, &SqlState::UNIQUE_VIOLATION];

/// A small SQL client used only for bootstrap catalog queries and
/// `CREATE DATABASE`. Abstracted behind a trait so the Provisioner can be
/// unit-tested with an in-memory fake instead of a real backend.
#[async_trait]
pub trait AdminChannel: Send + Sync {
    async fn existing_databases(&self) -> Result<Vec<String>, ProvisionError>;
    async fn create_database(&self, name: &str) -> Result<(), ProvisionError>;
}

/// Connects to the embedded backend's `postgres` database over its local
/// socket (preferred) or TCP, and serializes every statement through one
/// connection — the contract calls for at most a handful of concurrent
/// admin statements, so a single client with a tokio::sync::Mutex around
/// callers is simpler than pooling.
pub struct PgAdminChannel {
    client: tokio::sync::Mutex<tokio_postgres::Client>,
}

impl PgAdminChannel {
    /// `socket_dir` is the directory passed to `unix_socket_directories`;
    /// tokio_postgres appends the `.s.PGSQL.<port>` file name itself when
    /// the host looks like a filesystem path.
    pub async fn connect(socket_dir: &Path, tcp_port: u16) -> Result<Self, ProvisionError> {
        let mut config = tokio_postgres::Config::new();
        config
            .user("postgres")
            .dbname("postgres")
            .host(&socket_dir.to_string_lossy())
            .port(tcp_port)
            .connect_timeout(ADMIN_CONNECT_TIMEOUT);

        let connect = config.connect(tokio_postgres::NoTls);
        let (client, connection) = timeout(ADMIN_CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| ProvisionError::AdminChannelUnavailable("connect timed out".into()))?
            .map_err(|e| ProvisionError::AdminChannelUnavailable(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "admin channel connection driver exited");
            }
        });

        Ok(Self {
            client: tokio::sync::Mutex::new(client),
        })
    }
}

#[async_trait]
impl AdminChannel for PgAdminChannel {
    async fn existing_databases(&self) -> Result<Vec<String>, ProvisionError> {
        let client = self.client.lock().await;
        let rows = client
            .query("SELECT datname FROM pg_database WHERE NOT datistemplate", &[])
            .await
            .map_err(|e| ProvisionError::AdminChannelUnavailable(e.to_string()))?;
        Ok(rows.into_iter().map(|row| row.get::<_, String>(0)).collect())
    }

    async fn create_database(&self, name: &str) -> Result<(), ProvisionError> {
        let quoted = quote_identifier(name);
        let client = self.client.lock().await;
        match client.execute(&format!("CREATE DATABASE {quoted}"), &[]).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if is_already_exists(&e) {
                    warn!(database = name, "CREATE DATABASE raced an existing database");
                    Ok(())
                } else {
                    Err(ProvisionError::CreateFailed {
                        name: name.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn is_already_exists(err: &tokio_postgres::Error) -> bool {
    if let Some(db_err) = err.as_db_error() {
        if ALREADY_EXISTS_STATES.iter().any(|s| db_err.code() == *s) {
            return true;
        }
        if db_err.message().to_lowercase().contains("already exists") {
            return true;
        }
    }
    false
}
