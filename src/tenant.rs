use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;

/// One tenant's engine, opened at most once. Its lock is held while the WAL
/// replays, so only connections to that same tenant wait.
type TenantSlot = Arc<Mutex<Option<Arc<Engine>>>>;

/// Per-tenant engines, keyed by the database name of the pgwire connection.
/// Each tenant gets its own Engine, WAL file and compactor task.
pub struct TenantManager {
    engines: DashMap<String, TenantSlot>,
    opened: AtomicUsize,
    data_dir: PathBuf,
    compact_threshold: u64,
}

/// Keep only characters that are safe in a file name.
fn sanitize(tenant: &str) -> io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "tenant name too long",
        ));
    }
    let safe: String = tenant
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty tenant name",
        ));
    }
    Ok(safe)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            opened: AtomicUsize::new(0),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily create the engine for `tenant`.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        // Keyed by the sanitized name so "../a" and "a" share one WAL file.
        let safe_name = sanitize(tenant)?;
        let slot = self.slot(&safe_name)?;

        // The map's shard lock is already released here.
        let mut opened = slot
            .lock()
            .map_err(|_| io::Error::other("tenant slot poisoned"))?;
        if let Some(engine) = opened.as_ref() {
            return Ok(engine.clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(wal_path)?);
        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });
        *opened = Some(engine.clone());

        let count = self.opened.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(count as f64);
        tracing::info!("loaded tenant {safe_name}");
        Ok(engine)
    }

    fn slot(&self, safe_name: &str) -> io::Result<TenantSlot> {
        if let Some(slot) = self.engines.get(safe_name) {
            return Ok(slot.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }
        Ok(self
            .engines
            .entry(safe_name.to_string())
            .or_default()
            .value()
            .clone())
    }

    pub fn tenant_count(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bookdesk_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn service(id: Ulid) -> NewService {
        NewService {
            id,
            name: "Consultation".into(),
            description: None,
            duration_ms: 3_600_000,
            price_cents: 0,
        }
    }

    fn draft(service_id: Ulid, start: Ms, end: Ms) -> BookingDraft {
        BookingDraft {
            id: Ulid::new(),
            service_id,
            staff_id: None,
            customer_name: "Ada".into(),
            customer_email: None,
            start,
            end,
            status: BookingStatus::Confirmed,
            notes: None,
        }
    }

    const T0: Ms = 1_704_067_200_000;
    const H: Ms = 3_600_000;

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, 1000);

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        let sid = Ulid::new();
        eng_a.create_service(service(sid)).await.unwrap();
        eng_b.create_service(service(sid)).await.unwrap();

        eng_a.create_booking(draft(sid, T0, T0 + H)).await.unwrap();

        // Same range is free in the other tenant.
        assert_eq!(eng_b.check_conflict(T0, T0 + H, None).await.unwrap(), None);
        eng_b.create_booking(draft(sid, T0, T0 + H)).await.unwrap();
        assert!(eng_a.check_conflict(T0, T0 + H, None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), 1000);

        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        let _eng = tm.get_or_create("salon").unwrap();
        assert!(dir.join("salon.wal").exists());
        assert_eq!(tm.tenant_count(), 1);
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, 1000);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_opens_share_one_engine() {
        let dir = test_data_dir("concurrent_open");
        let tm = Arc::new(TenantManager::new(dir, 1000));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tm = tm.clone();
                tokio::spawn(async move { tm.get_or_create("busy").unwrap() })
            })
            .collect();
        let mut engines = Vec::new();
        for h in handles {
            engines.push(h.await.unwrap());
        }
        assert!(engines.iter().all(|e| Arc::ptr_eq(e, &engines[0])));
        assert_eq!(tm.tenant_count(), 1);
    }

    #[tokio::test]
    async fn opening_one_tenant_does_not_block_others() {
        let dir = test_data_dir("slot_lock");
        let tm = TenantManager::new(dir, 1000);

        // Hold one tenant's slot as if its WAL were still replaying.
        let busy = tm.slot("busy").unwrap();
        let _replaying = busy.lock().unwrap();

        let other = tm.get_or_create("other").unwrap();
        assert!(Arc::ptr_eq(&other, &tm.get_or_create("other").unwrap()));
        assert_eq!(tm.tenant_count(), 1);
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), 1000);

        let evil = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        let plain = tm.get_or_create("evil").unwrap();
        assert!(Arc::ptr_eq(&evil, &plain));

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, 1000);

        let err = tm
            .get_or_create(&"x".repeat(MAX_TENANT_NAME_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = TenantManager::new(dir, 1000);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }

    #[tokio::test]
    async fn tenant_reloads_from_disk() {
        let dir = test_data_dir("reload");
        let sid = Ulid::new();
        {
            let tm = TenantManager::new(dir.clone(), 1000);
            let eng = tm.get_or_create("clinic").unwrap();
            eng.create_service(service(sid)).await.unwrap();
            eng.create_booking(draft(sid, T0, T0 + H)).await.unwrap();
        }

        let tm = TenantManager::new(dir, 1000);
        let eng = tm.get_or_create("clinic").unwrap();
        assert_eq!(eng.list_services(Some(sid)).len(), 1);
        assert!(eng.check_conflict(T0 + H / 2, T0 + 2 * H, None).await.unwrap().is_some());
    }
}
