use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{Alert, AlertSeverity, AlertState};

/// Parameters for opening a new alert.
pub struct NewAlert<'a> {
    pub id: Uuid,
    pub rule_name: &'a str,
    pub severity: AlertSeverity,
    pub message: &'a str,
    pub opened_at: DateTime<Utc>,
}

/// Open a new alert row (state starts `Active`).
pub async fn open(pool: &SqlitePool, new: NewAlert<'_>) -> Result<Alert> {
    let severity = new.severity.to_string();
    let state = AlertState::Active.to_string();
    sqlx::query(
        r#"
        INSERT INTO alerts (id, rule_name, severity, state, message, opened_at, last_seen_at, resolved_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, NULL)
        "#,
    )
    .bind(new.id.to_string())
    .bind(new.rule_name)
    .bind(severity)
    .bind(state)
    .bind(new.message)
    .bind(new.opened_at)
    .bind(new.opened_at)
    .execute(pool)
    .await
    .context("failed to insert alert")?;

    get(pool, new.id)
        .await?
        .context("alert vanished immediately after insert")
}

/// Fetch a single alert by id.
pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<Option<Alert>> {
    let row = sqlx::query_as::<_, Alert>(
        "SELECT id, rule_name, severity, state, message, opened_at, last_seen_at, resolved_at \
         FROM alerts WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await
    .context("failed to fetch alert")?;
    Ok(row)
}

/// Fetch the single Active alert for a rule name, if one is open.
///
/// The one-Active-alert-per-rule invariant (spec §4.9) means this query
/// never needs to disambiguate between multiple rows.
pub async fn find_active_for_rule(pool: &SqlitePool, rule_name: &str) -> Result<Option<Alert>> {
    let row = sqlx::query_as::<_, Alert>(
        "SELECT id, rule_name, severity, state, message, opened_at, last_seen_at, resolved_at \
         FROM alerts WHERE rule_name = ? AND state = 'active'",
    )
    .bind(rule_name)
    .fetch_optional(pool)
    .await
    .context("failed to fetch active alert for rule")?;
    Ok(row)
}

/// List all alerts currently in the `Active` state.
pub async fn list_active(pool: &SqlitePool) -> Result<Vec<Alert>> {
    let rows = sqlx::query_as::<_, Alert>(
        "SELECT id, rule_name, severity, state, message, opened_at, last_seen_at, resolved_at \
         FROM alerts WHERE state = 'active' ORDER BY opened_at DESC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list active alerts")?;
    Ok(rows)
}

/// Bump `last_seen_at` on a still-firing alert (keeps it from auto-resolving).
pub async fn touch(pool: &SqlitePool, id: Uuid, seen_at: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE alerts SET last_seen_at = ? WHERE id = ?")
        .bind(seen_at)
        .bind(id.to_string())
        .execute(pool)
        .await
        .context("failed to touch alert")?;
    Ok(())
}

/// Acknowledge an open alert. No-op on alerts that are already resolved.
pub async fn acknowledge(pool: &SqlitePool, id: Uuid) -> Result<u64> {
    let state = AlertState::Acknowledged.to_string();
    let result = sqlx::query("UPDATE alerts SET state = ? WHERE id = ? AND state != 'resolved'")
        .bind(state)
        .bind(id.to_string())
        .execute(pool)
        .await
        .context("failed to acknowledge alert")?;
    Ok(result.rows_affected())
}

/// Resolve an alert, whether by an operator or by cooldown auto-resolve.
pub async fn resolve(pool: &SqlitePool, id: Uuid, resolved_at: DateTime<Utc>) -> Result<u64> {
    let state = AlertState::Resolved.to_string();
    let result = sqlx::query(
        "UPDATE alerts SET state = ?, resolved_at = ? WHERE id = ? AND state != 'resolved'",
    )
    .bind(state)
    .bind(resolved_at)
    .bind(id.to_string())
    .execute(pool)
    .await
    .context("failed to resolve alert")?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_test_utils::create_test_store;

    #[tokio::test]
    async fn open_then_find_active() {
        let store = create_test_store().await.unwrap();
        let id = Uuid::new_v4();
        let now = Utc::now();
        open(
            &store.pool,
            NewAlert {
                id,
                rule_name: "high_error_rate",
                severity: AlertSeverity::Critical,
                message: "error rate above threshold",
                opened_at: now,
            },
        )
        .await
        .unwrap();

        let active = find_active_for_rule(&store.pool, "high_error_rate")
            .await
            .unwrap();
        assert!(active.is_some());
        assert_eq!(active.unwrap().id, id);
    }

    #[tokio::test]
    async fn resolve_removes_from_active_list() {
        let store = create_test_store().await.unwrap();
        let id = Uuid::new_v4();
        let now = Utc::now();
        open(
            &store.pool,
            NewAlert {
                id,
                rule_name: "disk_full",
                severity: AlertSeverity::Medium,
                message: "disk usage high",
                opened_at: now,
            },
        )
        .await
        .unwrap();

        let affected = resolve(&store.pool, id, Utc::now()).await.unwrap();
        assert_eq!(affected, 1);

        let active = list_active(&store.pool).await.unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn resolve_twice_is_noop_second_time() {
        let store = create_test_store().await.unwrap();
        let id = Uuid::new_v4();
        open(
            &store.pool,
            NewAlert {
                id,
                rule_name: "flaky_resolver",
                severity: AlertSeverity::Info,
                message: "resolver degraded",
                opened_at: Utc::now(),
            },
        )
        .await
        .unwrap();

        assert_eq!(resolve(&store.pool, id, Utc::now()).await.unwrap(), 1);
        assert_eq!(resolve(&store.pool, id, Utc::now()).await.unwrap(), 0);
    }
}
