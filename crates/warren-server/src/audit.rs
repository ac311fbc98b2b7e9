//! Activity log for peer lifecycle events

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Activities recorded by the peer manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    PeerAddedByUser,
    PeerAddedWithSetupKey,
    PeerRenamed,
    PeerSshEnabled,
    PeerSshDisabled,
    PeerLoginExpirationEnabled,
    PeerLoginExpirationDisabled,
    PeerInactivityExpirationEnabled,
    PeerInactivityExpirationDisabled,
    PeerLoginExpired,
    PeerInactivityExpired,
    PeerRemovedByUser,
    UserLoggedInPeer,
}

/// Initiator recorded for scheduler-driven events.
pub const SYSTEM_INITIATOR: &str = "sys";

/// Persists activity events and mirrors them to the log. Event storage is
/// best-effort: a failed insert must never fail the enclosing operation.
#[derive(Clone)]
pub struct ActivityLogger {
    db: SqlitePool,
}

impl ActivityLogger {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn store_event(
        &self,
        initiator_id: &str,
        target_id: &str,
        account_id: &str,
        activity: Activity,
        meta: serde_json::Value,
    ) {
        tracing::info!(
            activity = ?activity,
            initiator = initiator_id,
            target = target_id,
            account = account_id,
            "activity event"
        );

        let result = sqlx::query(
            "INSERT INTO activity_log (id, activity, initiator_id, target_id, account_id, meta, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(serde_json::to_string(&activity).unwrap_or_default())
        .bind(initiator_id)
        .bind(target_id)
        .bind(account_id)
        .bind(meta.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await;

        if let Err(e) = result {
            tracing::error!("failed to write activity event: {e}");
        }
    }

    /// Query recorded events, newest first. Used by tests and the events
    /// API layer.
    pub async fn query(
        &self,
        account_id: &str,
        limit: i32,
    ) -> Result<Vec<(Activity, String, String, serde_json::Value)>, sqlx::Error> {
        let rows: Vec<(String, String, String, Option<String>)> = sqlx::query_as(
            "SELECT activity, initiator_id, target_id, meta FROM activity_log \
             WHERE account_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(activity, initiator, target, meta)| {
                let activity = serde_json::from_str(&activity).ok()?;
                let meta = meta
                    .and_then(|m| serde_json::from_str(&m).ok())
                    .unwrap_or(serde_json::Value::Null);
                Some((activity, initiator, target, meta))
            })
            .collect())
    }
}
