//! C4 — Relational Store: accounts, apps, deployments, package history,
//! access keys, collaborators, all soft-deletable. Directly adapted from
//! `clawd::storage::Storage`: one `SqlitePool` opened in WAL mode, typed row
//! structs, `async fn` CRUD per entity. Multi-row mutations run inside one
//! `sqlx::Transaction`, grounded on
//! `clawd::storage::Storage::create_message_and_increment_count`'s
//! begin/insert/insert/commit shape.

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use uuid::Uuid;

use crate::error::ApiError;

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Stored in the `collaborators.permission` column as its string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Owner,
    Collaborator,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Owner => "Owner",
            Permission::Collaborator => "Collaborator",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, ApiError> {
        match s {
            "Owner" => Ok(Permission::Owner),
            "Collaborator" => Ok(Permission::Collaborator),
            other => Err(ApiError::Internal(format!("unknown permission: {other}"))),
        }
    }

    /// Owner satisfies any requirement; Collaborator only satisfies
    /// Collaborator.
    pub fn satisfies(&self, required: Permission) -> bool {
        matches!((self, required), (Permission::Owner, _) | (Permission::Collaborator, Permission::Collaborator))
    }
}

/// Stored in the `packages.release_method` column as its string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMethod {
    Upload,
    Promote,
    Rollback,
}

impl ReleaseMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseMethod::Upload => "Upload",
            ReleaseMethod::Promote => "Promote",
            ReleaseMethod::Rollback => "Rollback",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, ApiError> {
        match s {
            "Upload" => Ok(ReleaseMethod::Upload),
            "Promote" => Ok(ReleaseMethod::Promote),
            "Rollback" => Ok(ReleaseMethod::Rollback),
            other => Err(ApiError::Internal(format!("unknown release method: {other}"))),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccountRow {
    pub id: String,
    pub email: String,
    pub name: String,
    pub linked_providers: String,
    pub created_time: i64,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccessKeyRow {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub friendly_name: String,
    pub created_by: Option<String>,
    pub created_time: i64,
    pub expires: i64,
    pub is_session: bool,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppRow {
    pub id: String,
    pub name: String,
    pub created_time: i64,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CollaboratorRow {
    pub app_id: String,
    pub account_id: String,
    pub permission: String,
}

impl CollaboratorRow {
    pub fn permission(&self) -> Result<Permission, ApiError> {
        Permission::from_str(&self.permission)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeploymentRow {
    pub id: String,
    pub app_id: String,
    pub name: String,
    pub key: String,
    pub created_time: i64,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PackageRow {
    pub id: String,
    pub deployment_id: String,
    pub label: String,
    pub app_version: String,
    pub description: Option<String>,
    pub is_disabled: bool,
    pub is_mandatory: bool,
    pub rollout: Option<i64>,
    pub size: i64,
    pub package_hash: String,
    pub blob_path: String,
    pub manifest_blob_path: Option<String>,
    pub release_method: String,
    pub original_label: Option<String>,
    pub original_deployment: Option<String>,
    pub released_by: Option<String>,
    pub upload_time: i64,
    pub deleted_at: Option<i64>,
}

impl PackageRow {
    pub fn release_method(&self) -> Result<ReleaseMethod, ApiError> {
        ReleaseMethod::from_str(&self.release_method)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PackageDiffRow {
    pub id: String,
    pub package_id: String,
    pub source_package_hash: String,
    pub size: i64,
    pub blob_path: String,
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("codepush.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Wraps an already-migrated pool. Used by sibling components (C7's
    /// metrics tests) that need a `Storage` handle without going through
    /// `Storage::new`'s filesystem setup.
    pub(crate) fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(crate) async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
        Self::migrate(pool).await
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        const SCHEMA: &str = "
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                linked_providers TEXT NOT NULL DEFAULT '[]',
                created_time INTEGER NOT NULL,
                deleted_at INTEGER
            );
            CREATE TABLE IF NOT EXISTS access_keys (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                name TEXT NOT NULL UNIQUE,
                friendly_name TEXT NOT NULL,
                created_by TEXT,
                created_time INTEGER NOT NULL,
                expires INTEGER NOT NULL,
                is_session INTEGER NOT NULL DEFAULT 0,
                deleted_at INTEGER
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_access_keys_friendly_name
                ON access_keys (account_id, friendly_name) WHERE deleted_at IS NULL;
            CREATE TABLE IF NOT EXISTS apps (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_time INTEGER NOT NULL,
                deleted_at INTEGER
            );
            CREATE TABLE IF NOT EXISTS collaborators (
                app_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                permission TEXT NOT NULL,
                PRIMARY KEY (app_id, account_id)
            );
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                app_id TEXT NOT NULL,
                name TEXT NOT NULL,
                key TEXT NOT NULL UNIQUE,
                created_time INTEGER NOT NULL,
                deleted_at INTEGER
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_app_name
                ON deployments (app_id, name) WHERE deleted_at IS NULL;
            CREATE TABLE IF NOT EXISTS packages (
                id TEXT PRIMARY KEY,
                deployment_id TEXT NOT NULL,
                label TEXT NOT NULL,
                app_version TEXT NOT NULL,
                description TEXT,
                is_disabled INTEGER NOT NULL DEFAULT 0,
                is_mandatory INTEGER NOT NULL DEFAULT 0,
                rollout INTEGER,
                size INTEGER NOT NULL,
                package_hash TEXT NOT NULL,
                blob_path TEXT NOT NULL,
                manifest_blob_path TEXT,
                release_method TEXT NOT NULL,
                original_label TEXT,
                original_deployment TEXT,
                released_by TEXT,
                upload_time INTEGER NOT NULL,
                deleted_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_packages_deployment
                ON packages (deployment_id, upload_time);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_packages_deployment_label
                ON packages (deployment_id, label) WHERE deleted_at IS NULL;
            CREATE TABLE IF NOT EXISTS package_diffs (
                id TEXT PRIMARY KEY,
                package_id TEXT NOT NULL,
                source_package_hash TEXT NOT NULL,
                size INTEGER NOT NULL,
                blob_path TEXT NOT NULL,
                UNIQUE(package_id, source_package_hash)
            );
            CREATE TABLE IF NOT EXISTS metrics (
                deployment_key TEXT NOT NULL,
                label TEXT NOT NULL,
                type TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (deployment_key, label, type)
            );
            CREATE TABLE IF NOT EXISTS client_labels (
                deployment_key TEXT NOT NULL,
                client_id TEXT NOT NULL,
                label TEXT NOT NULL,
                PRIMARY KEY (client_id, deployment_key)
            );
        ";
        for stmt in SCHEMA.split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(pool).await?;
            }
        }
        Ok(())
    }

    // ─── Accounts ───────────────────────────────────────────────────────────

    pub async fn create_account(&self, email: &str, name: &str) -> Result<AccountRow> {
        let id = Uuid::new_v4().to_string();
        let email = email.to_lowercase();
        sqlx::query(
            "INSERT INTO accounts (id, email, name, created_time) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&email)
        .bind(name)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        self.get_account(&id)
            .await?
            .ok_or_else(|| anyhow!("account not found after insert"))
    }

    pub async fn get_account(&self, id: &str) -> Result<Option<AccountRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM accounts WHERE id = ? AND deleted_at IS NULL")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn get_account_by_email(&self, email: &str) -> Result<Option<AccountRow>> {
        let email = email.to_lowercase();
        Ok(
            sqlx::query_as("SELECT * FROM accounts WHERE email = ? AND deleted_at IS NULL")
                .bind(&email)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Find an account by email, creating one if it doesn't exist yet (used
    /// by `transferApp`, which may target an email with no prior account).
    pub async fn get_or_create_account_by_email(&self, email: &str, name: &str) -> Result<AccountRow> {
        if let Some(existing) = self.get_account_by_email(email).await? {
            return Ok(existing);
        }
        self.create_account(email, name).await
    }

    // ─── Access Keys ────────────────────────────────────────────────────────

    pub async fn create_access_key(
        &self,
        account_id: &str,
        name: &str,
        friendly_name: &str,
        created_by: Option<&str>,
        expires: i64,
        is_session: bool,
    ) -> Result<AccessKeyRow, ApiError> {
        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM access_keys WHERE account_id = ? AND friendly_name = ? AND deleted_at IS NULL",
        )
        .bind(account_id)
        .bind(friendly_name)
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_some() {
            return Err(ApiError::AlreadyExists(format!(
                "access key '{friendly_name}' already exists"
            )));
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO access_keys (id, account_id, name, friendly_name, created_by, created_time, expires, is_session)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(account_id)
        .bind(name)
        .bind(friendly_name)
        .bind(created_by)
        .bind(now_ts())
        .bind(expires)
        .bind(is_session)
        .execute(&self.pool)
        .await?;
        self.get_access_key(&id)
            .await?
            .ok_or_else(|| ApiError::Internal("access key not found after insert".into()))
    }

    pub async fn get_access_key(&self, id: &str) -> Result<Option<AccessKeyRow>, ApiError> {
        Ok(
            sqlx::query_as("SELECT * FROM access_keys WHERE id = ? AND deleted_at IS NULL")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_access_keys(&self, account_id: &str) -> Result<Vec<AccessKeyRow>, ApiError> {
        Ok(sqlx::query_as(
            "SELECT * FROM access_keys WHERE account_id = ? AND deleted_at IS NULL ORDER BY created_time ASC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn remove_access_key(&self, id: &str) -> Result<(), ApiError> {
        sqlx::query("UPDATE access_keys SET deleted_at = ? WHERE id = ?")
            .bind(now_ts())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Resolves a bearer token to an account id. `NotFound` if no live key
    /// matches; `Expired` if the key exists but its deadline has passed.
    pub async fn get_account_id_from_access_key(&self, token: &str) -> Result<String, ApiError> {
        let row: Option<AccessKeyRow> =
            sqlx::query_as("SELECT * FROM access_keys WHERE name = ? AND deleted_at IS NULL")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            None => Err(ApiError::NotFound("access key".into())),
            Some(key) if now_ts() >= key.expires => Err(ApiError::Expired),
            Some(key) => Ok(key.account_id),
        }
    }

    // ─── Apps & Collaborators ───────────────────────────────────────────────

    /// Creates an app and its sole `Owner` collaborator row atomically.
    pub async fn add_app(&self, account_id: &str, name: &str) -> Result<AppRow, ApiError> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM apps a
             JOIN collaborators c ON c.app_id = a.id AND c.account_id = ? AND c.permission = 'Owner'
             WHERE a.name = ? AND a.deleted_at IS NULL",
        )
        .bind(account_id)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            return Err(ApiError::AlreadyExists(format!("app '{name}' already exists")));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_ts();
        sqlx::query("INSERT INTO apps (id, name, created_time) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(name)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO collaborators (app_id, account_id, permission) VALUES (?, ?, 'Owner')",
        )
        .bind(&id)
        .bind(account_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_app(&id)
            .await?
            .ok_or_else(|| ApiError::Internal("app not found after insert".into()))
    }

    pub async fn get_app(&self, id: &str) -> Result<Option<AppRow>, ApiError> {
        Ok(sqlx::query_as("SELECT * FROM apps WHERE id = ? AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn get_app_by_name(&self, account_id: &str, name: &str) -> Result<Option<AppRow>, ApiError> {
        Ok(sqlx::query_as(
            "SELECT a.* FROM apps a
             JOIN collaborators c ON c.app_id = a.id
             WHERE a.name = ? AND a.deleted_at IS NULL AND c.account_id = ?",
        )
        .bind(name)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn list_apps_for_account(&self, account_id: &str) -> Result<Vec<AppRow>, ApiError> {
        Ok(sqlx::query_as(
            "SELECT a.* FROM apps a
             JOIN collaborators c ON c.app_id = a.id
             WHERE a.deleted_at IS NULL AND c.account_id = ?
             ORDER BY a.created_time ASC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn list_collaborators(&self, app_id: &str) -> Result<Vec<CollaboratorRow>, ApiError> {
        Ok(sqlx::query_as("SELECT * FROM collaborators WHERE app_id = ?")
            .bind(app_id)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn get_collaborator(
        &self,
        app_id: &str,
        account_id: &str,
    ) -> Result<Option<CollaboratorRow>, ApiError> {
        Ok(
            sqlx::query_as("SELECT * FROM collaborators WHERE app_id = ? AND account_id = ?")
                .bind(app_id)
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn add_collaborator(
        &self,
        app_id: &str,
        account_id: &str,
        permission: Permission,
    ) -> Result<(), ApiError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO collaborators (app_id, account_id, permission) VALUES (?, ?, ?)
             ON CONFLICT(app_id, account_id) DO UPDATE SET permission = excluded.permission",
        )
        .bind(app_id)
        .bind(account_id)
        .bind(permission.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Removes `account_id` from `app_id`. Self-removal of a non-Owner is
    /// always allowed; removing the Owner is forbidden (enforced by C8
    /// before this is called, but checked again here defensively).
    pub async fn remove_collaborator(&self, app_id: &str, account_id: &str) -> Result<(), ApiError> {
        let collaborator = self
            .get_collaborator(app_id, account_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("collaborator".into()))?;
        if collaborator.permission()? == Permission::Owner {
            return Err(ApiError::Forbidden("cannot remove the app owner".into()));
        }
        sqlx::query("DELETE FROM collaborators WHERE app_id = ? AND account_id = ?")
            .bind(app_id)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Demotes the current Owner to Collaborator and promotes/creates
    /// `target_email` as the new Owner, all within one transaction (O1 must
    /// hold before and after).
    pub async fn transfer_app(&self, app_id: &str, target_email: &str) -> Result<(), ApiError> {
        let mut tx = self.pool.begin().await?;

        let target: Option<AccountRow> =
            sqlx::query_as("SELECT * FROM accounts WHERE email = ? AND deleted_at IS NULL")
                .bind(target_email.to_lowercase())
                .fetch_optional(&mut *tx)
                .await?;
        let target = match target {
            Some(a) => a,
            None => {
                let id = Uuid::new_v4().to_string();
                sqlx::query(
                    "INSERT INTO accounts (id, email, name, created_time) VALUES (?, ?, ?, ?)",
                )
                .bind(&id)
                .bind(target_email.to_lowercase())
                .bind(target_email)
                .bind(now_ts())
                .execute(&mut *tx)
                .await?;
                AccountRow {
                    id,
                    email: target_email.to_lowercase(),
                    name: target_email.to_string(),
                    linked_providers: "[]".into(),
                    created_time: now_ts(),
                    deleted_at: None,
                }
            }
        };

        sqlx::query(
            "UPDATE collaborators SET permission = 'Collaborator' WHERE app_id = ? AND permission = 'Owner'",
        )
        .bind(app_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO collaborators (app_id, account_id, permission) VALUES (?, ?, 'Owner')
             ON CONFLICT(app_id, account_id) DO UPDATE SET permission = 'Owner'",
        )
        .bind(app_id)
        .bind(&target.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_app(&self, app_id: &str) -> Result<(), ApiError> {
        sqlx::query("UPDATE apps SET deleted_at = ? WHERE id = ?")
            .bind(now_ts())
            .bind(app_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn rename_app(&self, app_id: &str, new_name: &str) -> Result<AppRow, ApiError> {
        sqlx::query("UPDATE apps SET name = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(new_name)
            .bind(app_id)
            .execute(&self.pool)
            .await?;
        self.get_app(app_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("app".into()))
    }

    // ─── Deployments ────────────────────────────────────────────────────────

    pub async fn add_deployment(&self, app_id: &str, name: &str, key: &str) -> Result<DeploymentRow, ApiError> {
        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM deployments WHERE app_id = ? AND name = ? AND deleted_at IS NULL",
        )
        .bind(app_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_some() {
            return Err(ApiError::AlreadyExists(format!("deployment '{name}' already exists")));
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO deployments (id, app_id, name, key, created_time) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(app_id)
        .bind(name)
        .bind(key)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        self.get_deployment(&id)
            .await?
            .ok_or_else(|| ApiError::Internal("deployment not found after insert".into()))
    }

    pub async fn get_deployment(&self, id: &str) -> Result<Option<DeploymentRow>, ApiError> {
        Ok(sqlx::query_as("SELECT * FROM deployments WHERE id = ? AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn get_deployment_by_name(&self, app_id: &str, name: &str) -> Result<Option<DeploymentRow>, ApiError> {
        Ok(sqlx::query_as(
            "SELECT * FROM deployments WHERE app_id = ? AND name = ? AND deleted_at IS NULL",
        )
        .bind(app_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn get_deployment_by_key(&self, key: &str) -> Result<Option<DeploymentRow>, ApiError> {
        Ok(
            sqlx::query_as("SELECT * FROM deployments WHERE key = ? AND deleted_at IS NULL")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_deployments(&self, app_id: &str) -> Result<Vec<DeploymentRow>, ApiError> {
        Ok(sqlx::query_as(
            "SELECT * FROM deployments WHERE app_id = ? AND deleted_at IS NULL ORDER BY created_time ASC",
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn remove_deployment(&self, id: &str) -> Result<(), ApiError> {
        sqlx::query("UPDATE deployments SET deleted_at = ? WHERE id = ?")
            .bind(now_ts())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Renames a deployment and/or rolls its key to `new_key` (CLI "rename"
    /// leaves `new_key` unset; "regenerate key" leaves `new_name` unset).
    pub async fn update_deployment(
        &self,
        id: &str,
        new_name: Option<&str>,
        new_key: Option<&str>,
    ) -> Result<DeploymentRow, ApiError> {
        let current = self
            .get_deployment(id)
            .await?
            .ok_or_else(|| ApiError::NotFound("deployment".into()))?;
        let name = new_name.unwrap_or(&current.name);
        let key = new_key.unwrap_or(&current.key);
        sqlx::query("UPDATE deployments SET name = ?, key = ? WHERE id = ?")
            .bind(name)
            .bind(key)
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.get_deployment(id)
            .await?
            .ok_or_else(|| ApiError::NotFound("deployment".into()))
    }

    // ─── Packages ───────────────────────────────────────────────────────────

    /// The non-deleted release history for `deployment_id`, ascending by
    /// `upload_time` — the order the Update Resolver (C6) scans backwards.
    pub async fn list_package_history(&self, deployment_id: &str) -> Result<Vec<PackageRow>, ApiError> {
        Self::list_package_history_with(&self.pool, deployment_id).await
    }

    /// Same query, but runnable against an open `sqlx::Transaction` so a
    /// caller can read the history, run the P2/P3 checks, and insert the new
    /// row without releasing the connection in between (see
    /// `release::commit_package`/`promote`).
    pub async fn list_package_history_with<'e, E>(
        executor: E,
        deployment_id: &str,
    ) -> Result<Vec<PackageRow>, ApiError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        Ok(sqlx::query_as(
            "SELECT * FROM packages WHERE deployment_id = ? AND deleted_at IS NULL ORDER BY upload_time ASC",
        )
        .bind(deployment_id)
        .fetch_all(executor)
        .await?)
    }

    pub async fn get_latest_package(&self, deployment_id: &str) -> Result<Option<PackageRow>, ApiError> {
        Self::get_latest_package_with(&self.pool, deployment_id).await
    }

    /// Same query, runnable against an open transaction — see
    /// `list_package_history_with`.
    pub async fn get_latest_package_with<'e, E>(
        executor: E,
        deployment_id: &str,
    ) -> Result<Option<PackageRow>, ApiError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        Ok(sqlx::query_as(
            "SELECT * FROM packages WHERE deployment_id = ? AND deleted_at IS NULL ORDER BY upload_time DESC LIMIT 1",
        )
        .bind(deployment_id)
        .fetch_optional(executor)
        .await?)
    }

    pub async fn get_package_by_label(&self, deployment_id: &str, label: &str) -> Result<Option<PackageRow>, ApiError> {
        Ok(sqlx::query_as(
            "SELECT * FROM packages WHERE deployment_id = ? AND label = ? AND deleted_at IS NULL",
        )
        .bind(deployment_id)
        .bind(label)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn count_live_packages(&self, deployment_id: &str) -> Result<i64, ApiError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM packages WHERE deployment_id = ? AND deleted_at IS NULL",
        )
        .bind(deployment_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Inserts a new package row, assigning the next `vN` label under a
    /// single connection so P1 (strictly increasing labels) holds even
    /// under concurrent commits against the same deployment — callers wrap
    /// this inside their own transaction for the P2/P3 checks that must
    /// precede it (see `release::commit_package`).
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_package<'e, E>(
        executor: E,
        deployment_id: &str,
        label: &str,
        app_version: &str,
        description: Option<&str>,
        is_disabled: bool,
        is_mandatory: bool,
        rollout: Option<i64>,
        size: i64,
        package_hash: &str,
        blob_path: &str,
        manifest_blob_path: Option<&str>,
        release_method: ReleaseMethod,
        original_label: Option<&str>,
        original_deployment: Option<&str>,
        released_by: Option<&str>,
    ) -> Result<PackageRow, ApiError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let id = Uuid::new_v4().to_string();
        let now = now_ts();
        sqlx::query(
            "INSERT INTO packages (id, deployment_id, label, app_version, description, is_disabled,
                is_mandatory, rollout, size, package_hash, blob_path, manifest_blob_path,
                release_method, original_label, original_deployment, released_by, upload_time)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(deployment_id)
        .bind(label)
        .bind(app_version)
        .bind(description)
        .bind(is_disabled)
        .bind(is_mandatory)
        .bind(rollout)
        .bind(size)
        .bind(package_hash)
        .bind(blob_path)
        .bind(manifest_blob_path)
        .bind(release_method.as_str())
        .bind(original_label)
        .bind(original_deployment)
        .bind(released_by)
        .bind(now)
        .execute(executor)
        .await?;

        Ok(PackageRow {
            id,
            deployment_id: deployment_id.to_string(),
            label: label.to_string(),
            app_version: app_version.to_string(),
            description: description.map(str::to_string),
            is_disabled,
            is_mandatory,
            rollout,
            size,
            package_hash: package_hash.to_string(),
            blob_path: blob_path.to_string(),
            manifest_blob_path: manifest_blob_path.map(str::to_string),
            release_method: release_method.as_str().to_string(),
            original_label: original_label.map(str::to_string),
            original_deployment: original_deployment.map(str::to_string),
            released_by: released_by.map(str::to_string),
            upload_time: now,
            deleted_at: None,
        })
    }

    pub async fn update_package(
        &self,
        id: &str,
        app_version: Option<&str>,
        description: Option<&str>,
        is_disabled: Option<bool>,
        is_mandatory: Option<bool>,
        rollout: Option<Option<i64>>,
    ) -> Result<(), ApiError> {
        let current = sqlx::query_as::<_, PackageRow>("SELECT * FROM packages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::NotFound("package".into()))?;

        let app_version = app_version.unwrap_or(&current.app_version);
        let description = description.or(current.description.as_deref());
        let is_disabled = is_disabled.unwrap_or(current.is_disabled);
        let is_mandatory = is_mandatory.unwrap_or(current.is_mandatory);
        let rollout = rollout.unwrap_or(current.rollout);

        sqlx::query(
            "UPDATE packages SET app_version = ?, description = ?, is_disabled = ?, is_mandatory = ?, rollout = ? WHERE id = ?",
        )
        .bind(app_version)
        .bind(description)
        .bind(is_disabled)
        .bind(is_mandatory)
        .bind(rollout)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_package_diff<'e, E>(
        executor: E,
        package_id: &str,
        source_package_hash: &str,
        size: i64,
        blob_path: &str,
    ) -> Result<(), ApiError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO package_diffs (id, package_id, source_package_hash, size, blob_path)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(package_id, source_package_hash) DO NOTHING",
        )
        .bind(id)
        .bind(package_id)
        .bind(source_package_hash)
        .bind(size)
        .bind(blob_path)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn get_access_key_by_friendly_name(
        &self,
        account_id: &str,
        friendly_name: &str,
    ) -> Result<Option<AccessKeyRow>, ApiError> {
        Ok(sqlx::query_as(
            "SELECT * FROM access_keys WHERE account_id = ? AND friendly_name = ? AND deleted_at IS NULL",
        )
        .bind(account_id)
        .bind(friendly_name)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn update_access_key(
        &self,
        id: &str,
        friendly_name: Option<&str>,
        expires: Option<i64>,
    ) -> Result<AccessKeyRow, ApiError> {
        let current = self
            .get_access_key(id)
            .await?
            .ok_or_else(|| ApiError::NotFound("access key".into()))?;
        let friendly_name = friendly_name.unwrap_or(&current.friendly_name);
        let expires = expires.unwrap_or(current.expires);
        sqlx::query("UPDATE access_keys SET friendly_name = ?, expires = ? WHERE id = ?")
            .bind(friendly_name)
            .bind(expires)
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.get_access_key(id)
            .await?
            .ok_or_else(|| ApiError::NotFound("access key".into()))
    }

    pub async fn list_package_diffs(&self, package_id: &str) -> Result<Vec<PackageDiffRow>, ApiError> {
        Ok(sqlx::query_as("SELECT * FROM package_diffs WHERE package_id = ?")
            .bind(package_id)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Sqlite>, ApiError> {
        Ok(self.pool.begin().await.context("begin transaction")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn storage() -> Storage {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        Storage::migrate(&pool).await.unwrap();
        Storage { pool }
    }

    #[tokio::test]
    async fn add_app_creates_exactly_one_owner() {
        let db = storage().await;
        let account = db.create_account("a@example.com", "A").await.unwrap();
        let app = db.add_app(&account.id, "myapp").await.unwrap();

        let collaborators = db.list_collaborators(&app.id).await.unwrap();
        assert_eq!(collaborators.len(), 1);
        assert_eq!(collaborators[0].account_id, account.id);
        assert_eq!(collaborators[0].permission().unwrap(), Permission::Owner);
    }

    #[tokio::test]
    async fn add_app_rejects_duplicate_name_for_same_owner() {
        let db = storage().await;
        let account = db.create_account("a@example.com", "A").await.unwrap();
        db.add_app(&account.id, "myapp").await.unwrap();
        let err = db.add_app(&account.id, "myapp").await.unwrap_err();
        assert!(matches!(err, ApiError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn create_access_key_rejects_duplicate_friendly_name() {
        let db = storage().await;
        let account = db.create_account("a@example.com", "A").await.unwrap();
        db.create_access_key(&account.id, "ck_1", "CLI", None, now_ts() + 3600, false)
            .await
            .unwrap();
        let err = db
            .create_access_key(&account.id, "ck_2", "CLI", None, now_ts() + 3600, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn get_account_id_from_access_key_reports_expired() {
        let db = storage().await;
        let account = db.create_account("a@example.com", "A").await.unwrap();
        db.create_access_key(&account.id, "ck_expired", "CLI", None, now_ts() - 10, false)
            .await
            .unwrap();
        let err = db
            .get_account_id_from_access_key("ck_expired")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Expired));
    }

    #[tokio::test]
    async fn remove_collaborator_forbids_removing_owner() {
        let db = storage().await;
        let account = db.create_account("a@example.com", "A").await.unwrap();
        let app = db.add_app(&account.id, "myapp").await.unwrap();
        let err = db
            .remove_collaborator(&app.id, &account.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[tokio::test]
    async fn transfer_app_preserves_single_owner_invariant() {
        let db = storage().await;
        let owner = db.create_account("owner@example.com", "Owner").await.unwrap();
        let app = db.add_app(&owner.id, "myapp").await.unwrap();

        db.transfer_app(&app.id, "new-owner@example.com").await.unwrap();

        let collaborators = db.list_collaborators(&app.id).await.unwrap();
        let owners: Vec<_> = collaborators
            .iter()
            .filter(|c| c.permission().unwrap() == Permission::Owner)
            .collect();
        assert_eq!(owners.len(), 1);
        assert_ne!(owners[0].account_id, owner.id);

        let old_owner_row = collaborators
            .iter()
            .find(|c| c.account_id == owner.id)
            .unwrap();
        assert_eq!(old_owner_row.permission().unwrap(), Permission::Collaborator);
    }

    #[tokio::test]
    async fn soft_deleted_app_is_invisible_to_lookups() {
        let db = storage().await;
        let account = db.create_account("a@example.com", "A").await.unwrap();
        let app = db.add_app(&account.id, "myapp").await.unwrap();

        db.remove_app(&app.id).await.unwrap();

        assert!(db.get_app(&app.id).await.unwrap().is_none());
        assert!(db
            .list_apps_for_account(&account.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn insert_package_runs_against_pool_directly() {
        let db = storage().await;
        let account = db.create_account("a@example.com", "A").await.unwrap();
        let app = db.add_app(&account.id, "myapp").await.unwrap();
        let deployment = db.add_deployment(&app.id, "Production", "dk_abc").await.unwrap();

        let package = Storage::insert_package(
            &db.pool,
            &deployment.id,
            "v1",
            "1.0.0",
            Some("first release"),
            false,
            false,
            None,
            100,
            "hash1",
            "apps/a/p1.zip",
            None,
            ReleaseMethod::Upload,
            None,
            None,
            Some(&account.id),
        )
        .await
        .unwrap();

        assert_eq!(package.label, "v1");
        assert_eq!(db.count_live_packages(&deployment.id).await.unwrap(), 1);
        assert_eq!(
            db.get_latest_package(&deployment.id).await.unwrap().unwrap().id,
            package.id
        );
    }
}
