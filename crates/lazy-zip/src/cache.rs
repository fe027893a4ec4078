//! Persistent fragment cache backed by sqlite.
//!
//! Fragments are raw byte ranges keyed by `(document url, fragment name)`;
//! a companion `doc_groups` table records per-document last-access times
//! used only by the eviction sweep. Multiple documents share one physical
//! store, and multiple lanes open independent handles on the same file.
//!
//! The cache is an optimization, never a correctness requirement: every
//! internal failure degrades to a miss (`get`) or is logged and swallowed
//! (`put`, eviction). A store that failed to open behaves as permanently
//! absent.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, trace, warn};
use url::Url;

/// Fragment count ceiling; the sweep only runs above it.
const LIVE_FRAGMENT_COUNT: i64 = 1000;

/// Groups accessed within this window are kept by the sweep.
const LIVE_GROUP_AGE_SECS: i64 = 60 * 60;

/// One document's handle on the shared fragment store.
pub struct FragmentCache {
    pool: Option<SqlitePool>,
    url: String,
}

impl FragmentCache {
    /// Open (creating if needed) the store at `path`, or the default
    /// XDG-cache location when `None`. Never fails: an unusable store
    /// yields a handle that misses on every lookup.
    ///
    /// Runs the eviction sweep unless `force_keep` is set.
    pub async fn open(url: &Url, path: Option<&Path>, force_keep: bool) -> Self {
        let url = url.to_string();
        let pool = match Self::connect(path).await {
            Ok(pool) => Some(pool),
            Err(e) => {
                warn!(url = %url, "fragment store unavailable, caching disabled: {e}");
                None
            }
        };

        let cache = Self { pool, url };
        if !force_keep {
            cache.clear_expired().await;
        }
        cache
    }

    /// In-memory store, for tests.
    #[cfg(test)]
    pub async fn open_memory(url: &Url) -> Self {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .expect("in-memory sqlite");
        migrate(&pool).await.expect("fragment schema");
        Self {
            pool: Some(pool),
            url: url.to_string(),
        }
    }

    async fn connect(path: Option<&Path>) -> Result<SqlitePool, sqlx::Error> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_store_path()
                .map_err(|e| sqlx::Error::Configuration(e.into()))?,
        };

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        migrate(&pool).await?;
        Ok(pool)
    }

    /// Look up a fragment for this document. A hit refreshes the document's
    /// group timestamp. Any failure is a miss.
    pub async fn get(&self, name: &str) -> Option<Bytes> {
        let pool = self.pool.as_ref()?;
        match self.get_inner(pool, name).await {
            Ok(Some(data)) => {
                trace!(url = %self.url, name, "fragment cache hit");
                Some(data)
            }
            Ok(None) => {
                trace!(url = %self.url, name, "fragment cache miss");
                None
            }
            Err(e) => {
                warn!(url = %self.url, name, "fragment lookup failed, treating as miss: {e}");
                None
            }
        }
    }

    async fn get_inner(&self, pool: &SqlitePool, name: &str) -> Result<Option<Bytes>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let row = sqlx::query("SELECT data FROM fragments WHERE url = ? AND name = ?")
            .bind(&self.url)
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let data: Vec<u8> = row.get("data");

        touch_group(&mut tx, &self.url).await?;
        tx.commit().await?;
        Ok(Some(Bytes::from(data)))
    }

    /// Upsert a fragment and refresh the group timestamp. Last writer wins;
    /// failures are logged and swallowed.
    pub async fn put(&self, name: &str, data: &[u8]) {
        let Some(pool) = self.pool.as_ref() else {
            return;
        };
        if let Err(e) = self.put_inner(pool, name, data).await {
            warn!(url = %self.url, name, "fragment write failed, skipping: {e}");
        }
    }

    async fn put_inner(
        &self,
        pool: &SqlitePool,
        name: &str,
        data: &[u8],
    ) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;

        sqlx::query(
            "INSERT INTO fragments (url, name, time, data) VALUES (?, ?, ?, ?) \
             ON CONFLICT(url, name) DO UPDATE SET time = excluded.time, data = excluded.data",
        )
        .bind(&self.url)
        .bind(name)
        .bind(unix_now())
        .bind(data)
        .execute(&mut *tx)
        .await?;

        touch_group(&mut tx, &self.url).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Count/age-bounded eviction sweep, run once at open.
    ///
    /// When the fragment count exceeds the ceiling, foreign documents whose
    /// group is older than one hour lose their group record, then their
    /// fragments are deleted oldest-first until the overage is consumed.
    /// This document's fragments are never touched. Safe to run redundantly
    /// from several lanes.
    pub(crate) async fn clear_expired(&self) {
        let Some(pool) = self.pool.as_ref() else {
            return;
        };
        if let Err(e) = self.clear_expired_inner(pool).await {
            warn!(url = %self.url, "eviction sweep failed, keeping cache as-is: {e}");
        }
    }

    async fn clear_expired_inner(&self, pool: &SqlitePool) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM fragments")
            .fetch_one(&mut *tx)
            .await?
            .get("n");
        if count <= LIVE_FRAGMENT_COUNT {
            return Ok(());
        }
        let mut overage = count - LIVE_FRAGMENT_COUNT;

        let cutoff = unix_now() - LIVE_GROUP_AGE_SECS;
        let mut kept: HashSet<String> = HashSet::new();
        kept.insert(self.url.clone());

        let groups = sqlx::query("SELECT url, time FROM doc_groups ORDER BY time ASC")
            .fetch_all(&mut *tx)
            .await?;
        for row in groups {
            let url: String = row.get("url");
            let time: i64 = row.get("time");
            if url == self.url || time >= cutoff {
                kept.insert(url);
            } else {
                sqlx::query("DELETE FROM doc_groups WHERE url = ?")
                    .bind(&url)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        let fragments = sqlx::query("SELECT rowid, url FROM fragments ORDER BY time ASC")
            .fetch_all(&mut *tx)
            .await?;
        let mut deleted = 0i64;
        for row in fragments {
            if overage == 0 {
                break;
            }
            let url: String = row.get("url");
            if kept.contains(&url) {
                continue;
            }
            let rowid: i64 = row.get("rowid");
            sqlx::query("DELETE FROM fragments WHERE rowid = ?")
                .bind(rowid)
                .execute(&mut *tx)
                .await?;
            overage -= 1;
            deleted += 1;
        }

        tx.commit().await?;
        debug!(url = %self.url, deleted, "eviction sweep finished");
        Ok(())
    }
}

async fn touch_group(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    url: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO doc_groups (url, time) VALUES (?, ?) \
         ON CONFLICT(url) DO UPDATE SET time = excluded.time",
    )
    .bind(url)
    .bind(unix_now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS fragments (
            url  TEXT    NOT NULL,
            name TEXT    NOT NULL,
            time INTEGER NOT NULL,
            data BLOB    NOT NULL,
            PRIMARY KEY (url, name)
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_fragments_time ON fragments (time)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS doc_groups (
            url  TEXT PRIMARY KEY,
            time INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_doc_groups_time ON doc_groups (time)")
        .execute(pool)
        .await?;
    Ok(())
}

fn default_store_path() -> std::io::Result<PathBuf> {
    let dirs = xdg::BaseDirectories::with_prefix("lazy-zip")
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::NotFound, e))?;
    dirs.place_cache_file("fragments.db")
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
