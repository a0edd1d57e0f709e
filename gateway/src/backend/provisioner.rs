use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::backend::admin::AdminChannel;
use crate::error::ProvisionError;

/// Single-flight coordinator: ensures at most one `CREATE DATABASE`
/// executes per name, even under concurrent callers. Realised with a
/// mutex-guarded map from name to a broadcast sender that the creating
/// call publishes its outcome on, per the reference design's
/// condition-variable-guarded map.
pub struct Provisioner {
    admin: Arc<dyn AdminChannel>,
    provisioned: Mutex<HashSet<String>>,
    inflight: Mutex<HashMap<String, broadcast::Sender<Result<(), ProvisionError>>>>,
}

impl Provisioner {
    /// Seeds the provisioned set from the backend catalog. If the query
    /// fails, startup still proceeds and `ensure` falls back entirely on
    /// the admin channel's already-exists mapping.
    pub async fn bootstrap(admin: Arc<dyn AdminChannel>) -> Self {
        let mut provisioned = HashSet::new();
        provisioned.insert("postgres".to_string());

        match admin.existing_databases().await {
            Ok(names) => {
                info!(count = names.len(), "seeded provisioned set from backend catalog");
                provisioned.extend(names);
            }
            Err(e) => {
                warn!(error = %e, "catalog bootstrap query failed; relying on already-exists fallback");
            }
        }

        Self {
            admin,
            provisioned: Mutex::new(provisioned),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn provisioned_databases(&self) -> Vec<String> {
        self.provisioned.lock().await.iter().cloned().collect()
    }

    pub async fn ensure(&self, name: &str) -> Result<(), ProvisionError> {
        if name == "postgres" {
            self.provisioned.lock().await.insert(name.to_string());
            return Ok(());
        }

        if self.provisioned.lock().await.contains(name) {
            return Ok(());
        }

        enum Role {
            Leader(broadcast::Sender<Result<(), ProvisionError>>),
            Follower(broadcast::Receiver<Result<(), ProvisionError>>),
        }

        let role = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(name) {
                Some(tx) => Role::Follower(tx.subscribe()),
                None => {
                    let (tx, _rx) = broadcast::channel(1);
                    inflight.insert(name.to_string(), tx.clone());
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => rx
                .recv()
                .await
                .map_err(|_| ProvisionError::AdminChannelUnavailable("creation task vanished".into()))?,
            Role::Leader(tx) => {
                let result = self.admin.create_database(name).await;
                if result.is_ok() {
                    self.provisioned.lock().await.insert(name.to_string());
                }
                self.inflight.lock().await.remove(name);
                // No receivers is fine: it just means nobody raced us.
                let _ = tx.send(result.clone());
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    struct CountingAdmin {
        create_calls: AtomicUsize,
        fail_names: Vec<String>,
    }

    #[async_trait]
    impl AdminChannel for CountingAdmin {
        async fn existing_databases(&self) -> Result<Vec<String>, ProvisionError> {
            Ok(vec![])
        }

        async fn create_database(&self, name: &str) -> Result<(), ProvisionError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            // Simulate real round-trip latency so concurrent callers overlap.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if self.fail_names.contains(&name.to_string()) {
                return Err(ProvisionError::CreateFailed {
                    name: name.to_string(),
                    reason: "simulated failure".into(),
                });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn postgres_database_always_succeeds_without_calling_admin() {
        let admin = Arc::new(CountingAdmin {
            create_calls: AtomicUsize::new(0),
            fail_names: vec![],
        });
        let provisioner = Provisioner::bootstrap(admin.clone()).await;
        provisioner.ensure("postgres").await.unwrap();
        assert_eq!(admin.create_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_ensure_calls_collapse_to_one_creation() {
        let admin = Arc::new(CountingAdmin {
            create_calls: AtomicUsize::new(0),
            fail_names: vec![],
        });
        let provisioner = Arc::new(Provisioner::bootstrap(admin.clone()).await);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let provisioner = provisioner.clone();
            handles.push(tokio::spawn(async move { provisioner.ensure("tenant_a").await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(admin.create_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn already_provisioned_name_skips_admin_entirely() {
        let admin = Arc::new(CountingAdmin {
            create_calls: AtomicUsize::new(0),
            fail_names: vec![],
        });
        let provisioner = Provisioner::bootstrap(admin.clone()).await;
        provisioner.ensure("tenant_b").await.unwrap();
        provisioner.ensure("tenant_b").await.unwrap();
        assert_eq!(admin.create_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_creation_propagates_to_all_waiters() {
        let admin = Arc::new(CountingAdmin {
            create_calls: AtomicUsize::new(0),
            fail_names: vec!["bad_db".to_string()],
        });
        let provisioner = Arc::new(Provisioner::bootstrap(admin.clone()).await);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let provisioner = provisioner.clone();
            handles.push(tokio::spawn(async move { provisioner.ensure("bad_db").await }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_err());
        }
        assert_eq!(admin.create_calls.load(Ordering::SeqCst), 1);
    }
}
