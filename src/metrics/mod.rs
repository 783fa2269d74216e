//! C7 — Metrics Counter: per-deployment install/active/failure counters.
//! Adapted from `clawd::metrics::store::MetricsStore`: same collapsing
//! upsert idiom (`INSERT ... ON CONFLICT DO UPDATE SET count = count + 1`,
//! grounded on its hourly-rollup upsert) and the same
//! `#[cfg(test)] mod tests` placement with an in-memory `SqlitePool`.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::ApiResult;
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelMetrics {
    pub active: i64,
    pub downloaded: i64,
    pub installed: i64,
    pub failed: i64,
}

pub struct MetricsCounter {
    storage: Storage,
}

impl MetricsCounter {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    async fn increment(&self, deployment_key: &str, label: &str, kind: &str) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO metrics (deployment_key, label, type, count) VALUES (?, ?, ?, 1)
             ON CONFLICT(deployment_key, label, type) DO UPDATE SET count = count + 1",
        )
        .bind(deployment_key)
        .bind(label)
        .bind(kind)
        .execute(&self.storage.pool())
        .await?;
        Ok(())
    }

    /// Decrements `(deployment_key, label, "active")`, clamped at zero — a
    /// device rolling over to a new label never drives the old label's
    /// active count negative.
    async fn decrement_active_floor_zero(&self, deployment_key: &str, label: &str) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO metrics (deployment_key, label, type, count) VALUES (?, ?, 'active', 0)
             ON CONFLICT(deployment_key, label, type) DO NOTHING",
        )
        .bind(deployment_key)
        .bind(label)
        .execute(&self.storage.pool())
        .await?;
        sqlx::query(
            "UPDATE metrics SET count = MAX(count - 1, 0)
             WHERE deployment_key = ? AND label = ? AND type = 'active'",
        )
        .bind(deployment_key)
        .bind(label)
        .execute(&self.storage.pool())
        .await?;
        Ok(())
    }

    async fn upsert_client_label(&self, deployment_key: &str, client_id: &str, label: &str) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO client_labels (deployment_key, client_id, label) VALUES (?, ?, ?)
             ON CONFLICT(client_id, deployment_key) DO UPDATE SET label = excluded.label",
        )
        .bind(deployment_key)
        .bind(client_id)
        .bind(label)
        .execute(&self.storage.pool())
        .await?;
        Ok(())
    }

    pub async fn record_download(&self, deployment_key: &str, label: &str, _client_id: &str) -> ApiResult<()> {
        self.increment(deployment_key, label, "downloaded").await
    }

    pub async fn record_deployment_status(
        &self,
        deployment_key: &str,
        label: &str,
        status: DeploymentStatus,
        client_id: &str,
    ) -> ApiResult<()> {
        match status {
            DeploymentStatus::Succeeded => {
                self.upsert_client_label(deployment_key, client_id, label).await?;
                self.increment(deployment_key, label, "deployment_succeeded").await?;
                self.increment(deployment_key, label, "active").await
            }
            DeploymentStatus::Failed => self.increment(deployment_key, label, "deployment_failed").await,
        }
    }

    /// Called on a fresh install to mark the device's transition to
    /// `current_label`. When `prev_key`/`prev_label` are supplied, the old
    /// label's active count is decremented (floor zero) before the new one
    /// is incremented.
    pub async fn record_deployment(
        &self,
        current_key: &str,
        current_label: &str,
        client_id: &str,
        prev_key: Option<&str>,
        prev_label: Option<&str>,
    ) -> ApiResult<()> {
        if let (Some(prev_key), Some(prev_label)) = (prev_key, prev_label) {
            self.decrement_active_floor_zero(prev_key, prev_label).await?;
        }
        self.upsert_client_label(current_key, client_id, current_label).await?;
        self.increment(current_key, current_label, "active").await
    }

    /// Reads all counters for `deployment_key`, aggregated per label into
    /// `{active, downloaded, installed, failed}` (spec.md §4.7). `installed`
    /// mirrors `deployment_succeeded`.
    pub async fn get_metrics(&self, deployment_key: &str) -> ApiResult<BTreeMap<String, LabelMetrics>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT label, type, count FROM metrics WHERE deployment_key = ?",
        )
        .bind(deployment_key)
        .fetch_all(&self.storage.pool())
        .await?;

        let mut out: BTreeMap<String, LabelMetrics> = BTreeMap::new();
        for (label, kind, count) in rows {
            let entry = out.entry(label).or_default();
            match kind.as_str() {
                "active" => entry.active = count,
                "downloaded" => entry.downloaded = count,
                "deployment_succeeded" => entry.installed = count,
                "deployment_failed" => entry.failed = count,
                _ => {}
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn counter() -> MetricsCounter {
        let pool = sqlx::SqlitePool::connect(":memory:").await.unwrap();
        crate::storage::Storage::migrate_pool(&pool).await.unwrap();
        MetricsCounter::new(crate::storage::Storage::from_pool(pool))
    }

    #[tokio::test]
    async fn record_download_increments_counter() {
        let m = counter().await;
        m.record_download("dk_1", "v1", "client-a").await.unwrap();
        m.record_download("dk_1", "v1", "client-b").await.unwrap();
        let metrics = m.get_metrics("dk_1").await.unwrap();
        assert_eq!(metrics["v1"].downloaded, 2);
    }

    #[tokio::test]
    async fn succeeded_status_bumps_installed_and_active() {
        let m = counter().await;
        m.record_deployment_status("dk_1", "v1", DeploymentStatus::Succeeded, "client-a")
            .await
            .unwrap();
        let metrics = m.get_metrics("dk_1").await.unwrap();
        assert_eq!(metrics["v1"].installed, 1);
        assert_eq!(metrics["v1"].active, 1);
    }

    #[tokio::test]
    async fn failed_status_bumps_only_failed() {
        let m = counter().await;
        m.record_deployment_status("dk_1", "v1", DeploymentStatus::Failed, "client-a")
            .await
            .unwrap();
        let metrics = m.get_metrics("dk_1").await.unwrap();
        assert_eq!(metrics["v1"].failed, 1);
        assert_eq!(metrics["v1"].active, 0);
    }

    #[tokio::test]
    async fn record_deployment_transitions_active_count_between_labels() {
        let m = counter().await;
        m.record_deployment("dk_1", "v1", "client-a", None, None).await.unwrap();
        m.record_deployment("dk_1", "v2", "client-a", Some("dk_1"), Some("v1"))
            .await
            .unwrap();
        let metrics = m.get_metrics("dk_1").await.unwrap();
        assert_eq!(metrics["v1"].active, 0);
        assert_eq!(metrics["v2"].active, 1);
    }

    #[tokio::test]
    async fn active_count_never_goes_negative() {
        let m = counter().await;
        m.record_deployment("dk_1", "v2", "client-a", Some("dk_1"), Some("v1"))
            .await
            .unwrap();
        let metrics = m.get_metrics("dk_1").await.unwrap();
        assert_eq!(metrics["v1"].active, 0);
    }
}
