//! Fragment-store tests against a real sqlite file on disk.
//!
//! The in-memory unit tests in the engine crate cover the transactional
//! contract; these exercise the on-disk store the way concurrent sessions
//! use it: several handles on one file, sweep at open, persistence across
//! handles.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use lazy_zip::FragmentCache;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tempfile::TempDir;
use url::Url;

fn doc(url: &str) -> Url {
    Url::parse(url).unwrap()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

async fn raw_pool(path: &Path) -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(SqliteConnectOptions::new().filename(path))
        .await
        .unwrap()
}

async fn backdate(pool: &SqlitePool, url: &str, time: i64) {
    sqlx::query("UPDATE fragments SET time = ? WHERE url = ?")
        .bind(time)
        .bind(url)
        .execute(pool)
        .await
        .unwrap();
    sqlx::query("UPDATE doc_groups SET time = ? WHERE url = ?")
        .bind(time)
        .bind(url)
        .execute(pool)
        .await
        .unwrap();
}

async fn count_for(pool: &SqlitePool, url: &str) -> i64 {
    sqlx::query("SELECT COUNT(*) AS n FROM fragments WHERE url = ?")
        .bind(url)
        .fetch_one(pool)
        .await
        .unwrap()
        .get("n")
}

#[tokio::test]
async fn fragments_persist_across_handles() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("fragments.db");

    let writer = FragmentCache::open(&doc("http://fixture/a.zip"), Some(db.as_path()), true).await;
    writer.put("cover.jpg", b"jpeg bytes").await;
    drop(writer);

    let reader = FragmentCache::open(&doc("http://fixture/a.zip"), Some(db.as_path()), true).await;
    assert_eq!(reader.get("cover.jpg").await.unwrap().as_ref(), b"jpeg bytes");
}

#[tokio::test]
async fn sweep_on_open_evicts_stale_foreign_documents() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("fragments.db");
    let stale_url = "http://fixture/stale.zip";
    let active_url = "http://fixture/active.zip";

    let stale = FragmentCache::open(&doc(stale_url), Some(db.as_path()), true).await;
    for i in 0..1100 {
        stale.put(&format!("s{i}"), b"x").await;
    }
    let active = FragmentCache::open(&doc(active_url), Some(db.as_path()), true).await;
    for i in 0..50 {
        active.put(&format!("a{i}"), b"x").await;
    }
    drop(stale);
    drop(active);

    let pool = raw_pool(&db).await;
    backdate(&pool, stale_url, unix_now() - 2 * 60 * 60).await;

    // Opening for the active document without force-keep runs the sweep:
    // the 150-fragment overage comes entirely out of the stale group.
    let _reopened = FragmentCache::open(&doc(active_url), Some(db.as_path()), false).await;
    assert_eq!(count_for(&pool, stale_url).await, 950);
    assert_eq!(count_for(&pool, active_url).await, 50);

    let stale_group = sqlx::query("SELECT time FROM doc_groups WHERE url = ?")
        .bind(stale_url)
        .fetch_optional(&pool)
        .await
        .unwrap();
    assert!(stale_group.is_none());
}

#[tokio::test]
async fn force_keep_skips_the_sweep() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("fragments.db");
    let stale_url = "http://fixture/stale.zip";

    let stale = FragmentCache::open(&doc(stale_url), Some(db.as_path()), true).await;
    for i in 0..1100 {
        stale.put(&format!("s{i}"), b"x").await;
    }
    drop(stale);

    let pool = raw_pool(&db).await;
    backdate(&pool, stale_url, unix_now() - 2 * 60 * 60).await;

    let _reopened =
        FragmentCache::open(&doc("http://fixture/other.zip"), Some(db.as_path()), true).await;
    assert_eq!(count_for(&pool, stale_url).await, 1100);
}

#[tokio::test]
async fn recently_accessed_foreign_documents_are_kept() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("fragments.db");
    let recent_url = "http://fixture/recent.zip";
    let stale_url = "http://fixture/stale.zip";

    let stale = FragmentCache::open(&doc(stale_url), Some(db.as_path()), true).await;
    for i in 0..1100 {
        stale.put(&format!("s{i}"), b"x").await;
    }
    let recent = FragmentCache::open(&doc(recent_url), Some(db.as_path()), true).await;
    for i in 0..20 {
        recent.put(&format!("r{i}"), b"x").await;
    }
    drop(stale);
    drop(recent);

    let pool = raw_pool(&db).await;
    backdate(&pool, stale_url, unix_now() - 2 * 60 * 60).await;

    let _reopened =
        FragmentCache::open(&doc("http://fixture/third.zip"), Some(db.as_path()), false).await;
    // 1120 total, so the 120-fragment overage is taken from the stale group.
    assert_eq!(count_for(&pool, recent_url).await, 20);
    assert_eq!(count_for(&pool, stale_url).await, 980);
}
