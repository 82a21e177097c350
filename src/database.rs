use std::fs;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::config::IdentityConfig;

const DATABASE_NAME: &str = "coderun.sqlite3";
const ACTIVE_SUBSCRIPTION: &str = "active";

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Manager,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manager => "manager",
            Self::Student => "student",
        }
    }

    fn from_db(value: &str) -> Option<Self> {
        match value {
            "manager" => Some(Self::Manager),
            "student" => Some(Self::Student),
            _ => None,
        }
    }
}

/// An authenticated caller
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub role: Role,
    pub subscription_status: String,
}

impl Identity {
    /// Whether this caller may invoke the execution engine
    pub fn may_execute(&self, require_active_subscription: bool) -> bool {
        match self.role {
            Role::Manager => true,
            Role::Student => {
                !require_active_subscription || self.subscription_status == ACTIVE_SUBSCRIPTION
            }
        }
    }
}

#[derive(sqlx::FromRow)]
struct IdentityRow {
    name: String,
    role: String,
    subscription_status: String,
}

pub fn get_db_path() -> anyhow::Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "coderun")
        .ok_or_else(|| anyhow!("Unable to find user directory"))?;
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir)?;

    Ok(data_dir.join(DATABASE_NAME))
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect(&db_url)
        .await?;

    for sql in &[
        "PRAGMA busy_timeout = 2000;", // 2 seconds timeout for lock contention
        "PRAGMA journal_mode = WAL;",
        r"
        CREATE TABLE IF NOT EXISTS identities (
            token_hash           TEXT    PRIMARY KEY,
            name                 TEXT    NOT NULL,
            role                 TEXT    NOT NULL,
            subscription_status  TEXT    NOT NULL DEFAULT 'inactive'
        );",
    ] {
        sqlx::query(sql).execute(&db_pool).await?;
    }

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // Remove WAL and SHM files (ignore errors as they might not exist)
    let _ = fs::remove_file(format!("{}-wal", db_path.as_ref().display()));
    let _ = fs::remove_file(format!("{}-shm", db_path.as_ref().display()));

    if let Err(e) = fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

/// Inserts or refreshes the identities listed in the configuration
pub async fn seed_identities(pool: &SqlitePool, identities: &[IdentityConfig]) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;
    for identity in identities {
        sqlx::query(
            "INSERT OR REPLACE INTO identities (token_hash, name, role, subscription_status)
             VALUES (?, ?, ?, ?)",
        )
        .bind(hash_token(&identity.token))
        .bind(&identity.name)
        .bind(identity.role.as_str())
        .bind(&identity.subscription_status)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    log::info!("Seeded {} identities", identities.len());
    Ok(())
}

/// Looks up the identity a bearer token belongs to
pub async fn find_identity(pool: &SqlitePool, token: &str) -> sqlx::Result<Option<Identity>> {
    let row = sqlx::query_as::<_, IdentityRow>(
        "SELECT name, role, subscription_status FROM identities WHERE token_hash = ?",
    )
    .bind(hash_token(token))
    .fetch_optional(pool)
    .await?;

    Ok(row.and_then(|row| {
        let Some(role) = Role::from_db(&row.role) else {
            log::warn!("Identity {} has unknown role {:?}, ignored", row.name, row.role);
            return None;
        };
        Some(Identity {
            name: row.name,
            role,
            subscription_status: row.subscription_status,
        })
    }))
}

/// Tokens are stored as SHA-256 hex digests, never in clear
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn identity(token: &str, name: &str, role: Role, status: &str) -> IdentityConfig {
        IdentityConfig {
            token: token.to_string(),
            name: name.to_string(),
            role,
            subscription_status: status.to_string(),
        }
    }

    #[test]
    fn test_hash_token() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_execution_policy() {
        let student = |status: &str| Identity {
            name: "s".to_string(),
            role: Role::Student,
            subscription_status: status.to_string(),
        };
        let manager = Identity {
            name: "m".to_string(),
            role: Role::Manager,
            subscription_status: "inactive".to_string(),
        };

        assert!(manager.may_execute(true));
        assert!(student("inactive").may_execute(false));
        assert!(!student("inactive").may_execute(true));
        assert!(student("active").may_execute(true));
    }

    #[tokio::test]
    async fn test_seed_and_find() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = init_db(tmp.path().join("ids.sqlite3")).await.unwrap();

        seed_identities(
            &pool,
            &[
                identity("t-manager", "alice", Role::Manager, "active"),
                identity("t-student", "bob", Role::Student, "inactive"),
            ],
        )
        .await
        .unwrap();

        let found = find_identity(&pool, "t-student").await.unwrap().unwrap();
        assert_eq!(found.name, "bob");
        assert_eq!(found.role, Role::Student);
        assert_eq!(found.subscription_status, "inactive");
        assert!(find_identity(&pool, "nope").await.unwrap().is_none());

        // Re-seeding updates in place
        seed_identities(&pool, &[identity("t-student", "bob", Role::Student, "active")])
            .await
            .unwrap();
        let found = find_identity(&pool, "t-student").await.unwrap().unwrap();
        assert_eq!(found.subscription_status, "active");
    }

    #[tokio::test]
    async fn test_remove_db() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ids.sqlite3");
        let pool = init_db(&path).await.unwrap();
        pool.close().await;

        assert!(path.exists());
        remove_db(&path);
        assert!(!path.exists());
    }
}
