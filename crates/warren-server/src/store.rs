//! Store gateway: pooled SQLite access, migrations and transactions

use futures_util::future::BoxFuture;
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};

use warren_core::error::{Error, Result};

use crate::locks::{ReadLockGuard, UidLocks, WriteLockGuard};

/// Row-lock hint carried on read operations. SQLite serializes writers at
/// the database level, so every strength renders to the plain statement; a
/// Postgres backend would map Share and Update to FOR SHARE / FOR UPDATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockingStrength {
    None,
    Share,
    Update,
}

impl LockingStrength {
    pub(crate) fn sql_suffix(self) -> &'static str {
        match self {
            LockingStrength::None | LockingStrength::Share | LockingStrength::Update => "",
        }
    }
}

/// Transactional access to persisted entities plus the advisory locks that
/// serialize multi-row operations above the database.
pub struct Store {
    pool: SqlitePool,
    locks: UidLocks,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: UidLocks::new(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>> {
        self.pool.acquire().await.map_err(store_err)
    }

    /// Runs `f` inside a single transaction: commit on `Ok`, rollback on
    /// `Err`. The closure receives the transaction connection and must not
    /// acquire further pool connections (the pool may be exhausted).
    pub async fn execute_in_transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        match f(&mut *tx).await {
            Ok(value) => {
                tx.commit().await.map_err(store_err)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!("transaction rollback failed: {rollback_err}");
                }
                Err(err)
            }
        }
    }

    /// Exclusive advisory lock for topology mutations on an account, or for
    /// a single peer when keyed by its WireGuard public key.
    pub async fn acquire_write_lock_by_uid(&self, uid: &str) -> WriteLockGuard {
        self.locks.acquire_write(uid).await
    }

    /// Shared advisory lock; lets logins for different peers of one account
    /// proceed in parallel while excluding topology writers.
    pub async fn acquire_read_lock_by_uid(&self, uid: &str) -> ReadLockGuard {
        self.locks.acquire_read(uid).await
    }
}

/// Maps driver errors onto the taxonomy. Uniqueness violations become the
/// distinguished retryable kind the allocation loop looks for.
pub(crate) fn store_err(err: sqlx::Error) -> Error {
    match err {
        sqlx::Error::RowNotFound => Error::NotFound("record".into()),
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::UniqueConstraint(db.message().to_string())
        }
        other => Error::Internal(other.to_string()),
    }
}

/// Run database migrations
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            network_cidr TEXT NOT NULL,
            network_serial INTEGER NOT NULL DEFAULT 0,
            dns_domain TEXT,
            peer_login_expiration_enabled INTEGER NOT NULL DEFAULT 0,
            peer_login_expiration_secs INTEGER NOT NULL DEFAULT 86400,
            peer_inactivity_expiration_enabled INTEGER NOT NULL DEFAULT 0,
            peer_inactivity_expiration_secs INTEGER NOT NULL DEFAULT 600,
            regular_users_view_blocked INTEGER NOT NULL DEFAULT 0,
            extra_settings TEXT
        );

        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'user',
            blocked INTEGER NOT NULL DEFAULT 0,
            auto_groups TEXT NOT NULL DEFAULT '[]',
            last_login TEXT,
            FOREIGN KEY (account_id) REFERENCES accounts(id)
        );

        CREATE TABLE IF NOT EXISTS peers (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            pub_key TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            dns_label TEXT NOT NULL,
            ip TEXT NOT NULL,
            user_id TEXT,
            meta TEXT NOT NULL DEFAULT '{}',
            connected INTEGER NOT NULL DEFAULT 0,
            last_seen TEXT NOT NULL,
            login_expired INTEGER NOT NULL DEFAULT 0,
            ssh_enabled INTEGER NOT NULL DEFAULT 0,
            ssh_key TEXT NOT NULL DEFAULT '',
            login_expiration_enabled INTEGER NOT NULL DEFAULT 0,
            inactivity_expiration_enabled INTEGER NOT NULL DEFAULT 0,
            ephemeral INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            last_login TEXT NOT NULL,
            connection_ip TEXT,
            country_code TEXT NOT NULL DEFAULT '',
            city_name TEXT NOT NULL DEFAULT '',
            geo_name_id INTEGER NOT NULL DEFAULT 0,
            extra_dns_labels TEXT NOT NULL DEFAULT '[]',
            allow_extra_dns_labels INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (account_id) REFERENCES accounts(id),
            UNIQUE (account_id, dns_label),
            UNIQUE (account_id, ip)
        );

        CREATE INDEX IF NOT EXISTS idx_peers_account ON peers(account_id);
        CREATE INDEX IF NOT EXISTS idx_peers_pub_key ON peers(pub_key);

        CREATE TABLE IF NOT EXISTS groups (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY (account_id) REFERENCES accounts(id),
            UNIQUE (account_id, name)
        );

        CREATE TABLE IF NOT EXISTS group_peers (
            group_id TEXT NOT NULL,
            peer_id TEXT NOT NULL,
            PRIMARY KEY (group_id, peer_id),
            FOREIGN KEY (group_id) REFERENCES groups(id)
        );

        CREATE INDEX IF NOT EXISTS idx_group_peers_peer ON group_peers(peer_id);

        CREATE TABLE IF NOT EXISTS setup_keys (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            key_hash TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            auto_groups TEXT NOT NULL DEFAULT '[]',
            ephemeral INTEGER NOT NULL DEFAULT 0,
            allow_extra_dns_labels INTEGER NOT NULL DEFAULT 0,
            revoked INTEGER NOT NULL DEFAULT 0,
            expires_at TEXT,
            usage_limit INTEGER NOT NULL DEFAULT 0,
            used_times INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (account_id) REFERENCES accounts(id)
        );

        CREATE INDEX IF NOT EXISTS idx_setup_keys_hash ON setup_keys(key_hash);

        CREATE TABLE IF NOT EXISTS policies (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            name TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            rules TEXT NOT NULL DEFAULT '[]',
            source_posture_checks TEXT NOT NULL DEFAULT '[]',
            FOREIGN KEY (account_id) REFERENCES accounts(id)
        );

        CREATE TABLE IF NOT EXISTS network_routers (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            peer_id TEXT NOT NULL DEFAULT '',
            peer_groups TEXT NOT NULL DEFAULT '[]',
            network TEXT NOT NULL,
            masquerade INTEGER NOT NULL DEFAULT 0,
            metric INTEGER NOT NULL DEFAULT 9999,
            enabled INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY (account_id) REFERENCES accounts(id)
        );

        CREATE TABLE IF NOT EXISTS posture_checks (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            name TEXT NOT NULL,
            checks TEXT NOT NULL DEFAULT '{}',
            FOREIGN KEY (account_id) REFERENCES accounts(id)
        );

        CREATE TABLE IF NOT EXISTS activity_log (
            id TEXT PRIMARY KEY,
            activity TEXT NOT NULL,
            initiator_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            meta TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_activity_account ON activity_log(account_id);
        CREATE INDEX IF NOT EXISTS idx_activity_created ON activity_log(created_at);
        "#,
    )
    .execute(pool)
    .await
    .map_err(store_err)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory database");
        migrate(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = test_pool().await;
        migrate(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let store = Store::new(test_pool().await);

        let result: Result<()> = store
            .execute_in_transaction(|tx| {
                Box::pin(async move {
                    sqlx::query(
                        "INSERT INTO accounts (id, network_cidr) VALUES ('acc', '100.64.0.0/16')",
                    )
                    .execute(tx)
                    .await
                    .map_err(store_err)?;
                    Err(Error::internal("boom"))
                })
            })
            .await;
        assert!(result.is_err());

        let mut conn = store.acquire().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM accounts")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn unique_violation_maps_to_retryable_error() {
        let store = Store::new(test_pool().await);
        let mut conn = store.acquire().await.unwrap();
        sqlx::query("INSERT INTO accounts (id, network_cidr) VALUES ('acc', '100.64.0.0/16')")
            .execute(&mut *conn)
            .await
            .unwrap();
        let err = sqlx::query("INSERT INTO accounts (id, network_cidr) VALUES ('acc', '10.0.0.0/8')")
            .execute(&mut *conn)
            .await
            .map_err(store_err)
            .unwrap_err();
        assert!(err.is_unique_constraint());
    }
}
