//! Service policy persistence and the read-mostly cache.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

use crate::incidents::decode_timestamp;
use crate::types::{LlmProviderPref, ServicePolicy};
use crate::{Store, StoreError, StoreResult};

impl Store {
    /// Fetch the policy for a service, provisioning defaults on first
    /// observation.
    pub async fn policy_or_default(
        &self,
        service_id: &str,
        service_name: &str,
    ) -> StoreResult<ServicePolicy> {
        if let Some(policy) = self.policy(service_id).await? {
            return Ok(policy);
        }

        let policy = ServicePolicy::defaults_for(service_id, service_name);
        // Two callers may race the insert; the unique key makes the loser's
        // insert a no-op and the stored row wins.
        sqlx::query(
            "INSERT OR IGNORE INTO service_policies (service_id, service_name, \
             auto_remediation_enabled, default_memory_mb, default_replicas, llm_provider, \
             confidence_threshold, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&policy.service_id)
        .bind(&policy.service_name)
        .bind(i64::from(policy.auto_remediation_enabled))
        .bind(policy.default_memory_mb)
        .bind(policy.default_replicas)
        .bind(policy.llm_provider.as_str())
        .bind(policy.confidence_threshold)
        .bind(policy.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.policy(service_id)
            .await?
            .ok_or_else(|| StoreError::PolicyNotFound(service_id.to_string()))
    }

    /// Fetch a policy if one exists.
    pub async fn policy(&self, service_id: &str) -> StoreResult<Option<ServicePolicy>> {
        let row = sqlx::query("SELECT * FROM service_policies WHERE service_id = ?")
            .bind(service_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_policy).transpose()
    }

    /// Replace a policy row.
    pub async fn update_policy(&self, policy: &ServicePolicy) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO service_policies (service_id, service_name, auto_remediation_enabled, \
             default_memory_mb, default_replicas, llm_provider, confidence_threshold, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (service_id) DO UPDATE SET service_name = excluded.service_name, \
             auto_remediation_enabled = excluded.auto_remediation_enabled, \
             default_memory_mb = excluded.default_memory_mb, \
             default_replicas = excluded.default_replicas, \
             llm_provider = excluded.llm_provider, \
             confidence_threshold = excluded.confidence_threshold, \
             updated_at = excluded.updated_at",
        )
        .bind(&policy.service_id)
        .bind(&policy.service_name)
        .bind(i64::from(policy.auto_remediation_enabled))
        .bind(policy.default_memory_mb)
        .bind(policy.default_replicas)
        .bind(policy.llm_provider.as_str())
        .bind(policy.confidence_threshold)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Read-mostly cache in front of the policy table.
///
/// Writers go through [`Store::update_policy`] and publish a
/// `policies:updated` message; subscribers call [`PolicyCache::invalidate`]
/// on receipt.
pub struct PolicyCache {
    store: Store,
    entries: DashMap<String, Arc<ServicePolicy>>,
}

impl PolicyCache {
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store,
            entries: DashMap::new(),
        }
    }

    /// Fetch the policy for a service, from cache when warm.
    pub async fn get(
        &self,
        service_id: &str,
        service_name: &str,
    ) -> StoreResult<Arc<ServicePolicy>> {
        if let Some(entry) = self.entries.get(service_id) {
            return Ok(Arc::clone(&entry));
        }
        let policy = Arc::new(self.store.policy_or_default(service_id, service_name).await?);
        self.entries
            .insert(service_id.to_string(), Arc::clone(&policy));
        Ok(policy)
    }

    /// Drop a cached entry (or all of them when `service_id` is `None`).
    pub fn invalidate(&self, service_id: Option<&str>) {
        match service_id {
            Some(id) => {
                self.entries.remove(id);
                debug!(service_id = %id, "Policy cache entry invalidated");
            }
            None => {
                self.entries.clear();
                debug!("Policy cache cleared");
            }
        }
    }
}

fn row_to_policy(row: &SqliteRow) -> StoreResult<ServicePolicy> {
    let provider: String = row.try_get("llm_provider")?;
    let updated_at: String = row.try_get("updated_at")?;
    let auto: i64 = row.try_get("auto_remediation_enabled")?;

    Ok(ServicePolicy {
        service_id: row.try_get("service_id")?,
        service_name: row.try_get("service_name")?,
        auto_remediation_enabled: auto != 0,
        default_memory_mb: row.try_get("default_memory_mb")?,
        default_replicas: row.try_get("default_replicas")?,
        llm_provider: LlmProviderPref::parse(&provider)?,
        confidence_threshold: row.try_get("confidence_threshold")?,
        updated_at: decode_timestamp("updated_at", &updated_at)?,
    })
}
