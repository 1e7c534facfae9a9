use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + compactor.
/// Tenant = database name from the pgwire connection, keyed by its sanitized form.
pub struct TenantManager {
    /// The cell lets concurrent first connections to one tenant share a single
    /// WAL replay instead of each opening the file.
    engines: DashMap<String, Arc<OnceCell<Arc<Engine>>>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    lock_timeout: Duration,
    admin_user: String,
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        lock_timeout: Duration,
        admin_user: String,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            lock_timeout,
            admin_user,
        }
    }

    /// Get or lazily create the engine for `tenant`. A new tenant is seeded
    /// with the admin manager account.
    pub async fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        // Names that sanitize alike share one WAL, so they must share one engine.
        let name = sanitize(tenant)?;
        let wal_path = self.data_dir.join(format!("{name}.wal"));

        let cell = match self.engines.get(&name) {
            Some(cell) => cell.value().clone(),
            None => {
                // len() read-locks every shard, so check before taking the entry.
                if self.engines.len() >= MAX_TENANTS {
                    return Err(std::io::Error::other("too many tenants"));
                }
                match self.engines.entry(name.clone()) {
                    Entry::Occupied(e) => e.get().clone(),
                    Entry::Vacant(e) => e.insert(Arc::new(OnceCell::new())).value().clone(),
                }
            }
        };

        let engine = cell
            .get_or_try_init(|| async {
                let engine = Arc::new(Engine::new(wal_path, self.lock_timeout)?);
                if let Some(admin) = engine
                    .ensure_admin(&self.admin_user)
                    .await
                    .map_err(std::io::Error::other)?
                {
                    tracing::info!("tenant {name}: seeded manager account {}", admin.username);
                }

                let compactor_engine = engine.clone();
                let threshold = self.compact_threshold;
                tokio::spawn(async move {
                    compactor::run_compactor(compactor_engine, threshold).await;
                });
                metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
                Ok::<_, std::io::Error>(engine)
            })
            .await?;
        Ok(engine.clone())
    }
}

/// Restrict tenant names to a safe file stem, preventing path traversal.
fn sanitize(tenant: &str) -> std::io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "tenant name too long",
        ));
    }
    let safe_name: String = tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe_name.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty tenant name",
        ));
    }
    Ok(safe_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Actor, UserFields};
    use std::fs;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("reservad_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, Duration::from_secs(2), "admin".into())
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let tm = manager(test_data_dir("isolation"));

        let eng_a = tm.get_or_create("escola_a").await.unwrap();
        let eng_b = tm.get_or_create("escola_b").await.unwrap();

        let admin_a = eng_a.resolve_actor("admin").unwrap();
        eng_a
            .create_user(
                &admin_a,
                UserFields {
                    username: Some("paula".into()),
                    role: Some("P".into()),
                    ni: Some(1001),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(eng_a.resolve_actor("paula").is_ok());
        assert!(eng_b.resolve_actor("paula").is_err());
        assert_eq!(eng_b.user_count(), 1);
    }

    #[tokio::test]
    async fn new_tenant_is_seeded_once() {
        let dir = test_data_dir("seeded");
        {
            let tm = manager(dir.clone());
            let engine = tm.get_or_create("escola").await.unwrap();
            let admin: Actor = engine.resolve_actor("ADMIN").unwrap();
            assert_eq!(admin.role, crate::model::Role::Manager);
        }
        let tm = manager(dir);
        let engine = tm.get_or_create("escola").await.unwrap();
        assert_eq!(engine.user_count(), 1);
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").await.unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_connections_share_one_engine() {
        let tm = Arc::new(manager(test_data_dir("same_eng")));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tm = tm.clone();
                tokio::spawn(async move { tm.get_or_create("foo").await.unwrap() })
            })
            .collect();
        let mut engines = Vec::new();
        for h in handles {
            engines.push(h.await.unwrap());
        }
        assert!(engines.iter().all(|e| Arc::ptr_eq(e, &engines[0])));
        assert_eq!(engines[0].user_count(), 1);
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let _eng = tm.get_or_create("../evil").await.unwrap();
        assert!(dir.join("evil.wal").exists());

        assert!(tm.get_or_create("../..").await.is_err());
    }

    #[tokio::test]
    async fn aliases_of_one_wal_share_an_engine() {
        let dir = test_data_dir("aliases");
        {
            let tm = manager(dir.clone());
            let plain = tm.get_or_create("escola").await.unwrap();
            let dotted = tm.get_or_create("esc.ola").await.unwrap();
            assert!(Arc::ptr_eq(&plain, &dotted));

            let admin = plain.resolve_actor("admin").unwrap();
            let fields = UserFields {
                username: Some("paula".into()),
                role: Some("P".into()),
                ni: Some(7),
                ..Default::default()
            };
            assert!(plain.create_user(&admin, fields.clone()).await.is_ok());
            assert!(dotted.create_user(&admin, fields).await.is_err());
        }

        let wals: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert_eq!(wals.len(), 1);
        let tm = manager(dir);
        let engine = tm.get_or_create("esc.ola").await.unwrap();
        assert_eq!(engine.user_count(), 2);
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let tm = manager(test_data_dir("name_too_long"));

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).await.err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }
}
