//! End-to-end pool tests against the local fixture server.
//!
//! These validate the externally observable contract: entry listing order,
//! exact network request counts, cache warm-up across sessions, request
//! dedup, abort semantics, and the permanent in-memory fallback when the
//! server ignores range requests.

use std::time::Duration;

use lazy_zip::{FetchError, FormatError, LazyZip, Settings};
use tempfile::TempDir;


use zip_fixture::{FixtureEntry, ServerState, build_archive, init_logging, payload, serve};

fn settings(dir: &TempDir) -> Settings {
    Settings::new().cache_path(dir.path().join("fragments.db"))
}

fn three_entries() -> Vec<FixtureEntry> {
    vec![
        FixtureEntry::stored("a.txt", payload(100, 1)),
        FixtureEntry::stored("b.jpg", payload(5000, 2)),
        FixtureEntry::stored("c.html", payload(300, 3)),
    ]
}

fn log_summary(server: &ServerState) -> String {
    format!("request log: {:?}", server.request_log())
}

#[tokio::test]
async fn entry_names_and_exact_request_counts_with_colocated_directory() {
    init_logging();
    let cache_dir = TempDir::new().unwrap();
    let (url, server) = serve(build_archive(&three_entries(), b""), true).await;

    // Small archive: the tail probe covers the central directory too.
    let zip = LazyZip::connect(&url, settings(&cache_dir)).await.unwrap();
    assert_eq!(zip.entry_names(), ["a.txt", "b.jpg", "c.html"]);
    assert_eq!(server.request_count(), 1, "{}", log_summary(&server));

    let buffer = zip.get_buffer("b.jpg").await.unwrap();
    assert_eq!(buffer.as_ref(), payload(5000, 2).as_slice());
    assert_eq!(server.request_count(), 2, "{}", log_summary(&server));

    // Second read of the same entry is served locally.
    let again = zip.get_buffer("b.jpg").await.unwrap();
    assert_eq!(again, buffer);
    assert_eq!(server.request_count(), 2, "{}", log_summary(&server));
}

#[tokio::test]
async fn central_directory_outside_the_tail_probe_costs_one_extra_request() {
    init_logging();
    let cache_dir = TempDir::new().unwrap();

    // A 200 KB entry plus a maximum-length comment leaves the central
    // directory outside the 65557-byte tail probe.
    let entries = vec![
        FixtureEntry::stored("big.bin", payload(200_000, 7)),
        FixtureEntry::stored("small.txt", payload(64, 9)),
    ];
    let comment = vec![b'#'; 65_535];
    let (url, server) = serve(build_archive(&entries, &comment), true).await;

    let zip = LazyZip::connect(&url, settings(&cache_dir)).await.unwrap();
    assert_eq!(zip.entry_names(), ["big.bin", "small.txt"]);
    assert_eq!(server.request_count(), 2, "{}", log_summary(&server));

    let buffer = zip.get_buffer("big.bin").await.unwrap();
    assert_eq!(buffer.as_ref(), payload(200_000, 7).as_slice());
    assert_eq!(server.request_count(), 3, "{}", log_summary(&server));
}

#[tokio::test]
async fn concurrent_requests_for_one_entry_share_a_single_fetch() {
    init_logging();
    let cache_dir = TempDir::new().unwrap();
    let (url, server) = serve(build_archive(&three_entries(), b""), true).await;

    let zip = LazyZip::connect(&url, settings(&cache_dir)).await.unwrap();
    let (first, second) = tokio::join!(zip.get_buffer("a.txt"), zip.get_buffer("a.txt"));

    let first = first.unwrap();
    assert_eq!(first, second.unwrap());
    assert_eq!(first.as_ref(), payload(100, 1).as_slice());
    // connect + exactly one entry-span request
    assert_eq!(server.request_count(), 2, "{}", log_summary(&server));
}

#[tokio::test]
async fn warm_cache_session_needs_zero_network() {
    init_logging();
    let cache_dir = TempDir::new().unwrap();
    let (url, server) = serve(build_archive(&three_entries(), b""), true).await;

    let first_read = {
        let zip = LazyZip::connect(&url, settings(&cache_dir)).await.unwrap();
        zip.get_buffer("c.html").await.unwrap()
    };
    let after_first_session = server.request_count();

    // A fresh pool over the same store bootstraps and reads from cache.
    let zip = LazyZip::connect(&url, settings(&cache_dir)).await.unwrap();
    let second_read = zip.get_buffer("c.html").await.unwrap();

    assert_eq!(second_read, first_read);
    assert_eq!(
        server.request_count(),
        after_first_session,
        "{}",
        log_summary(&server)
    );
}

#[tokio::test]
async fn server_without_range_support_downloads_once_and_serves_locally() {
    init_logging();
    let cache_dir = TempDir::new().unwrap();
    let (url, server) = serve(build_archive(&three_entries(), b""), false).await;

    let zip = LazyZip::connect(&url, settings(&cache_dir)).await.unwrap();
    assert_eq!(zip.entry_names(), ["a.txt", "b.jpg", "c.html"]);

    // One rejected range probe, then one full download.
    assert_eq!(server.range_request_count(), 1, "{}", log_summary(&server));
    assert_eq!(server.request_count(), 2, "{}", log_summary(&server));

    for (name, expected) in [
        ("a.txt", payload(100, 1)),
        ("b.jpg", payload(5000, 2)),
        ("c.html", payload(300, 3)),
    ] {
        let buffer = zip.get_buffer(name).await.unwrap();
        assert_eq!(buffer.as_ref(), expected.as_slice());
    }
    assert_eq!(server.request_count(), 2, "{}", log_summary(&server));

    // A later session bootstraps entirely from the fragment store: no
    // range request is ever attempted for this document again.
    drop(zip);
    let zip = LazyZip::connect(&url, settings(&cache_dir)).await.unwrap();
    let buffer = zip.get_buffer("b.jpg").await.unwrap();
    assert_eq!(buffer.as_ref(), payload(5000, 2).as_slice());
    assert_eq!(server.request_count(), 2, "{}", log_summary(&server));
}

#[tokio::test]
async fn force_in_memory_never_issues_a_range_request() {
    init_logging();
    let cache_dir = TempDir::new().unwrap();
    let (url, server) = serve(build_archive(&three_entries(), b""), true).await;

    let zip = LazyZip::connect(&url, settings(&cache_dir).force_in_memory(true))
        .await
        .unwrap();
    let buffer = zip.get_buffer("a.txt").await.unwrap();

    assert_eq!(buffer.as_ref(), payload(100, 1).as_slice());
    assert_eq!(server.range_request_count(), 0, "{}", log_summary(&server));
    assert_eq!(server.request_count(), 1, "{}", log_summary(&server));
}

#[tokio::test]
async fn abort_after_resolution_has_no_observable_effect() {
    init_logging();
    let cache_dir = TempDir::new().unwrap();
    let (url, _server) = serve(build_archive(&three_entries(), b""), true).await;

    let zip = LazyZip::connect(&url, settings(&cache_dir)).await.unwrap();
    let buffer = zip.get_buffer("a.txt").await.unwrap();

    zip.abort("a.txt");
    zip.abort("never-requested");

    let again = zip.get_buffer("a.txt").await.unwrap();
    assert_eq!(again, buffer);
}

#[tokio::test]
async fn abort_cancels_an_inflight_fetch() {
    init_logging();
    let cache_dir = TempDir::new().unwrap();
    let (url, server) = serve(build_archive(&three_entries(), b""), true).await;

    let zip = LazyZip::connect(&url, settings(&cache_dir)).await.unwrap();
    server.set_response_delay(Some(Duration::from_secs(30)));

    let fetch = zip.get_buffer("a.txt");
    let abort = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        zip.abort("a.txt");
    };
    let (result, ()) = tokio::join!(fetch, abort);
    assert!(matches!(result.unwrap_err(), FetchError::Cancelled));
}

#[tokio::test]
async fn a_cancelled_entry_can_be_retried_with_the_same_name() {
    init_logging();
    let cache_dir = TempDir::new().unwrap();
    let (url, server) = serve(build_archive(&three_entries(), b""), true).await;

    let zip = LazyZip::connect(&url, settings(&cache_dir)).await.unwrap();
    server.set_response_delay(Some(Duration::from_secs(30)));

    let fetch = zip.get_buffer("b.jpg");
    let abort = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        zip.abort("b.jpg");
    };
    let (cancelled, ()) = tokio::join!(fetch, abort);
    assert!(matches!(cancelled.unwrap_err(), FetchError::Cancelled));

    // pending slots are removed once the shared outcome settles; give the
    // watcher tasks a beat so the retry cannot join the cancelled outcome
    server.set_response_delay(None);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let before = server.request_count();

    let buffer = zip.get_buffer("b.jpg").await.unwrap();
    assert_eq!(buffer.as_ref(), payload(5000, 2).as_slice());
    assert_eq!(
        server.request_count(),
        before + 1,
        "{}",
        log_summary(&server)
    );
}

#[tokio::test]
async fn prefetch_all_warms_every_entry_once() {
    init_logging();
    let cache_dir = TempDir::new().unwrap();
    let (url, server) = serve(build_archive(&three_entries(), b""), true).await;

    let zip = LazyZip::connect(&url, settings(&cache_dir)).await.unwrap();
    zip.prefetch_all().await.unwrap();

    // connect + one span request per entry
    assert_eq!(server.request_count(), 4, "{}", log_summary(&server));

    zip.prefetch_all().await.unwrap();
    let buffer = zip.get_buffer("c.html").await.unwrap();
    assert_eq!(buffer.as_ref(), payload(300, 3).as_slice());
    assert_eq!(server.request_count(), 4, "{}", log_summary(&server));
}

#[tokio::test]
async fn deflated_entries_decode_to_their_original_bytes() {
    init_logging();
    let cache_dir = TempDir::new().unwrap();
    let entries = vec![
        FixtureEntry::deflated("readme.md", payload(20_000, 11)),
        FixtureEntry::stored("raw.bin", payload(512, 13)),
    ];
    let (url, _server) = serve(build_archive(&entries, b""), true).await;

    let zip = LazyZip::connect(&url, settings(&cache_dir)).await.unwrap();
    let buffer = zip.get_buffer("readme.md").await.unwrap();
    assert_eq!(buffer.as_ref(), payload(20_000, 11).as_slice());
}

#[tokio::test]
async fn unknown_entry_fails_without_poisoning_others() {
    init_logging();
    let cache_dir = TempDir::new().unwrap();
    let (url, _server) = serve(build_archive(&three_entries(), b""), true).await;

    let zip = LazyZip::connect(&url, settings(&cache_dir)).await.unwrap();
    let err = zip.get_buffer("missing.txt").await.unwrap_err();
    assert!(matches!(
        err,
        FetchError::Format(FormatError::EntryNotFound(_))
    ));

    let buffer = zip.get_buffer("a.txt").await.unwrap();
    assert_eq!(buffer.as_ref(), payload(100, 1).as_slice());
}

#[tokio::test]
async fn invalid_url_is_rejected_up_front() {
    let err = LazyZip::connect("not a url", Settings::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::InvalidUrl(_)));
}
