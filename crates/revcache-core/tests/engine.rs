//! Integration tests for CacheEngine against a mocked origin.
//!
//! Uses wiremock for the origin. Covers full fetch, version hits, conditional
//! revalidation (304), stale fallback (403), error passthrough (404/5xx),
//! coalescing of concurrent misses, force refresh, priming, index recovery and
//! local disk failures seen by coalesced waiters.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use revcache_core::{
    CacheEngine, CacheEntry, CacheError, Disposition, EngineConfig, InvalidationFlag,
    LookupOptions, NameTables, ResourceKey, Route,
};
use reqwest::header::{HeaderMap, HeaderValue, REFERER};
use tempfile::TempDir;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LAST_MODIFIED: &str = "Tue, 01 Oct 2024 00:00:00 GMT";

async fn create_test_engine(temp_dir: &TempDir) -> CacheEngine {
    let config = EngineConfig::default()
        .with_cache_root(temp_dir.path().join("content"))
        .with_save_quiet_ms(50);
    let flag = InvalidationFlag::new();
    let policy = Arc::new(NameTables::new(
        Vec::new(),
        vec!["/kcs2/version.json".to_string()],
        flag.clone(),
    ));
    CacheEngine::open(config, policy, flag)
        .await
        .expect("failed to open engine")
}

/// Wait until every background write has landed.
async fn settle(engine: &CacheEngine) {
    for _ in 0..200 {
        if engine.in_flight() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("fetches still in flight");
}

async fn seed(engine: &CacheEngine, key: &str, version: &str, body: &[u8]) {
    let key = ResourceKey::new(key);
    engine
        .store()
        .write_atomic(&engine.store().path_for(&key), body)
        .await
        .unwrap();
    engine
        .index()
        .insert(
            key.as_str(),
            CacheEntry {
                version: version.to_string(),
                last_modified: Some(LAST_MODIFIED.to_string()),
                length: body.len() as u64,
                cache_control: Some("max-age=2592000, public".to_string()),
            },
        )
        .await;
}

#[tokio::test]
async fn test_full_fetch_then_hit() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/kcs2/img.png"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![7u8; 5120])
                .insert_header("last-modified", LAST_MODIFIED)
                .insert_header("cache-control", "max-age=2592000, public"),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let engine = create_test_engine(&temp_dir).await;
    let url = format!("{}/kcs2/img.png", mock_server.uri());

    let first = engine
        .lookup(&url, &LookupOptions::default())
        .await
        .expect("lookup failed");
    assert_eq!(first.route, Route::Fetch);
    assert_eq!(first.status, 200);
    assert_eq!(first.contents.as_ref().map(Bytes::len), Some(5120));
    settle(&engine).await;

    let entry = engine.entry(&url).await.unwrap().expect("entry recorded");
    assert_eq!(
        entry,
        CacheEntry {
            version: String::new(),
            last_modified: Some(LAST_MODIFIED.to_string()),
            length: 5120,
            cache_control: Some("max-age=2592000, public".to_string()),
        }
    );
    let on_disk = tokio::fs::read(temp_dir.path().join("content/kcs2/img.png"))
        .await
        .unwrap();
    assert_eq!(on_disk.len(), 5120);

    let second = engine
        .lookup(&url, &LookupOptions::default())
        .await
        .unwrap();
    assert_eq!(second.route, Route::Hit);
    assert_eq!(second.contents, first.contents);
}

#[tokio::test]
async fn test_matching_version_never_contacts_origin() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&mock_server)
        .await;

    let engine = create_test_engine(&temp_dir).await;
    seed(&engine, "/kcs2/img.png", "abc123", b"cached").await;

    let resolved = engine
        .lookup(
            &format!("{}/kcs2/img.png?abc123", mock_server.uri()),
            &LookupOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(resolved.route, Route::Hit);
    assert_eq!(resolved.contents, Some(Bytes::from_static(b"cached")));
}

#[tokio::test]
async fn test_not_modified_confirms_new_version() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/kcs2/img.png"))
        .and(header_exists("if-modified-since"))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&mock_server)
        .await;

    let engine = create_test_engine(&temp_dir).await;
    seed(&engine, "/kcs2/img.png", "abc123", b"cached").await;

    let url = format!("{}/kcs2/img.png?xyz999", mock_server.uri());
    let resolved = engine
        .lookup(&url, &LookupOptions::default())
        .await
        .unwrap();

    assert_eq!(resolved.route, Route::Revalidate);
    assert_eq!(resolved.status, 200);
    assert_eq!(resolved.disposition, Disposition::Served);
    assert_eq!(resolved.contents, Some(Bytes::from_static(b"cached")));

    let entry = engine.entry(&url).await.unwrap().unwrap();
    assert_eq!(entry.version, "xyz999");
    assert_eq!(entry.last_modified.as_deref(), Some(LAST_MODIFIED));

    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(
        requests[0]
            .headers
            .get("if-modified-since")
            .and_then(|v| v.to_str().ok()),
        Some(LAST_MODIFIED)
    );
}

#[tokio::test]
async fn test_not_modified_without_cache_passes_through() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/kcs2/img.png"))
        .respond_with(ResponseTemplate::new(304))
        .mount(&mock_server)
        .await;

    let engine = create_test_engine(&temp_dir).await;
    let url = format!("{}/kcs2/img.png", mock_server.uri());

    let resolved = engine
        .lookup(&url, &LookupOptions::default())
        .await
        .unwrap();
    assert_eq!(resolved.status, 304);
    assert!(resolved.contents.is_none());
    assert_eq!(resolved.disposition, Disposition::NotModifiedPassthrough);

    // priming drops content-less outcomes
    assert!(engine.prime(&url).await.unwrap().is_none());
}

#[tokio::test]
async fn test_forbidden_serves_stale_and_raises_flag() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/kcs2/version.json"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&mock_server)
        .await;

    let engine = create_test_engine(&temp_dir).await;
    seed(&engine, "/kcs2/version.json", "1", b"{\"v\":1}").await;

    let url = format!("{}/kcs2/version.json?2", mock_server.uri());
    let resolved = engine
        .lookup(&url, &LookupOptions::default())
        .await
        .unwrap();

    assert_eq!(resolved.status, 200);
    assert_eq!(resolved.disposition, Disposition::StaleFallback);
    assert_eq!(resolved.contents, Some(Bytes::from_static(b"{\"v\":1}")));
    assert!(engine.flag().is_raised());
    assert_eq!(engine.entry(&url).await.unwrap().unwrap().version, "1");

    // the manifest stays suspect: even a matching version is revalidated
    let again = engine
        .lookup(
            &format!("{}/kcs2/version.json?1", mock_server.uri()),
            &LookupOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(again.route, Route::Revalidate);
}

#[tokio::test]
async fn test_clean_refetch_clears_manifest_invalidation() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/kcs2/version.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"v\":2}"))
        .mount(&mock_server)
        .await;

    let engine = create_test_engine(&temp_dir).await;
    seed(&engine, "/kcs2/version.json", "1", b"{\"v\":1}").await;
    engine.flag().raise();

    let url = format!("{}/kcs2/version.json?2", mock_server.uri());
    let fetched = engine
        .lookup(&url, &LookupOptions::default())
        .await
        .unwrap();
    assert_eq!(fetched.contents, Some(Bytes::from_static(b"{\"v\":2}")));
    settle(&engine).await;

    let hit = engine
        .lookup(&url, &LookupOptions::default())
        .await
        .unwrap();
    assert_eq!(hit.route, Route::Hit);
}

#[tokio::test]
async fn test_forbidden_without_cache_passes_through() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/kcs2/img.png"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&mock_server)
        .await;

    let engine = create_test_engine(&temp_dir).await;
    let resolved = engine
        .lookup(
            &format!("{}/kcs2/img.png", mock_server.uri()),
            &LookupOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(resolved.status, 403);
    assert_eq!(resolved.disposition, Disposition::ErrorPassthrough);
    assert!(!engine.flag().is_raised());
}

#[tokio::test]
async fn test_not_found_is_passed_through_and_not_cached() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/kcs2/missing.png"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such asset"))
        .expect(2)
        .mount(&mock_server)
        .await;

    let engine = create_test_engine(&temp_dir).await;
    let url = format!("{}/kcs2/missing.png", mock_server.uri());

    for _ in 0..2 {
        let resolved = engine
            .lookup(&url, &LookupOptions::default())
            .await
            .unwrap();
        assert_eq!(resolved.status, 404);
        assert_eq!(resolved.contents, Some(Bytes::from_static(b"no such asset")));
        assert_eq!(resolved.disposition, Disposition::ErrorPassthrough);
    }

    assert!(engine.entry(&url).await.unwrap().is_none());
    assert!(!temp_dir.path().join("content/kcs2/missing.png").exists());
}

#[tokio::test]
async fn test_server_error_surfaces_as_upstream_error() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/kcs2/img.png"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&mock_server)
        .await;

    let engine = create_test_engine(&temp_dir).await;
    let err = engine
        .lookup(
            &format!("{}/kcs2/img.png", mock_server.uri()),
            &LookupOptions::default(),
        )
        .await
        .unwrap_err();

    match err {
        CacheError::Upstream { status, body } => {
            assert_eq!(status, 503);
            assert_eq!(body, Bytes::from_static(b"maintenance"));
        }
        other => panic!("expected upstream error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_misses_share_one_fetch() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/kcs2/big.png"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![1u8; 64 * 1024])
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let engine = Arc::new(create_test_engine(&temp_dir).await);
    let url = format!("{}/kcs2/big.png", mock_server.uri());

    let mut handles = Vec::new();
    for _ in 0..5 {
        let engine = Arc::clone(&engine);
        let url = url.clone();
        handles.push(tokio::spawn(async move {
            engine.lookup(&url, &LookupOptions::default()).await
        }));
    }

    for handle in handles {
        let resolved = handle.await.unwrap().unwrap();
        assert_eq!(resolved.status, 200);
        assert_eq!(resolved.contents.map(|b| b.len()), Some(64 * 1024));
    }
    settle(&engine).await;
    assert_eq!(engine.index().len().await, 1);
}

#[tokio::test]
async fn test_force_refresh_replaces_cached_copy() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/kcs2/img.png"))
        .respond_with(ResponseTemplate::new(200).set_body_string("fresh"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let engine = create_test_engine(&temp_dir).await;
    seed(&engine, "/kcs2/img.png", "abc123", b"truncated-or-stale").await;

    let url = format!("{}/kcs2/img.png?abc123", mock_server.uri());
    let resolved = engine
        .lookup(&url, &LookupOptions::default().with_force_refresh(true))
        .await
        .unwrap();
    assert_eq!(resolved.route, Route::Fetch);
    assert_eq!(resolved.contents, Some(Bytes::from_static(b"fresh")));
    settle(&engine).await;

    let on_disk = tokio::fs::read(temp_dir.path().join("content/kcs2/img.png"))
        .await
        .unwrap();
    assert_eq!(on_disk, b"fresh");
    assert_eq!(engine.entry(&url).await.unwrap().unwrap().length, 5);
}

#[tokio::test]
async fn test_client_headers_are_forwarded() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/kcs2/img.png"))
        .and(header("referer", "http://203.104.209.7/kcs2/index.php"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let engine = create_test_engine(&temp_dir).await;
    let mut headers = HeaderMap::new();
    headers.insert(
        REFERER,
        HeaderValue::from_static("http://203.104.209.7/kcs2/index.php"),
    );

    let resolved = engine
        .lookup(
            &format!("{}/kcs2/img.png", mock_server.uri()),
            &LookupOptions::default().with_headers(headers),
        )
        .await
        .unwrap();
    assert_eq!(resolved.status, 200);
    settle(&engine).await;
}

#[tokio::test]
async fn test_prime_caches_without_client() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/kcs2/js/main.js"))
        .respond_with(ResponseTemplate::new(200).set_body_string("main();"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let engine = create_test_engine(&temp_dir).await;
    let url = format!("{}/kcs2/js/main.js?5.1.2.0", mock_server.uri());

    let primed = engine.prime(&url).await.unwrap();
    assert!(primed.is_some());
    settle(&engine).await;

    assert_eq!(engine.entry(&url).await.unwrap().unwrap().version, "5.1.2.0");
}

#[tokio::test]
async fn test_index_saved_after_quiet_period() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/kcs2/img.png"))
        .respond_with(ResponseTemplate::new(200).set_body_string("png"))
        .mount(&mock_server)
        .await;

    let engine = create_test_engine(&temp_dir).await;
    engine
        .lookup(
            &format!("{}/kcs2/img.png?v1", mock_server.uri()),
            &LookupOptions::default(),
        )
        .await
        .unwrap();
    settle(&engine).await;

    let index_path = temp_dir.path().join("cache.json");
    for _ in 0..100 {
        if engine.index().saves_completed() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let saved: serde_json::Value =
        serde_json::from_slice(&tokio::fs::read(&index_path).await.unwrap()).unwrap();
    assert_eq!(saved["/kcs2/img.png"]["version"], "v1");
    assert_eq!(saved["/kcs2/img.png"]["length"], 3);
}

#[tokio::test]
async fn test_open_recovers_interrupted_save() {
    let temp_dir = TempDir::new().unwrap();
    let index_path = temp_dir.path().join("cache.json");

    // A save died after moving the good copy aside and half-writing the new one.
    tokio::fs::write(
        temp_dir.path().join("cache.json.bak"),
        r#"{"/kcs2/img.png":{"version":"abc123","length":6}}"#,
    )
    .await
    .unwrap();
    tokio::fs::write(&index_path, r#"{"/kcs2/img.png":{"vers"#)
        .await
        .unwrap();

    let engine = create_test_engine(&temp_dir).await;
    let entry = engine
        .entry("http://203.104.209.7/kcs2/img.png")
        .await
        .unwrap()
        .expect("backup promoted");
    assert_eq!(entry.version, "abc123");
    assert!(!temp_dir.path().join("cache.json.bak").exists());
}

#[tokio::test]
async fn test_cancelled_first_request_does_not_fail_waiters() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/kcs2/big.png"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("big")
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let engine = Arc::new(create_test_engine(&temp_dir).await);
    let url = format!("{}/kcs2/big.png", mock_server.uri());

    let first = {
        let engine = Arc::clone(&engine);
        let url = url.clone();
        tokio::spawn(async move { engine.lookup(&url, &LookupOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = {
        let engine = Arc::clone(&engine);
        let url = url.clone();
        tokio::spawn(async move { engine.lookup(&url, &LookupOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // client of the first request hangs up mid-fetch
    first.abort();

    let resolved = second.await.unwrap().expect("waiter should get the origin result");
    assert_eq!(resolved.status, 200);
    assert_eq!(resolved.contents, Some(Bytes::from_static(b"big")));

    settle(&engine).await;
    assert_eq!(engine.entry(&url).await.unwrap().unwrap().length, 3);
}

#[tokio::test]
async fn test_unreadable_stale_copy_fails_every_waiter() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/kcs2/img.png"))
        .respond_with(
            ResponseTemplate::new(403).set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let engine = Arc::new(create_test_engine(&temp_dir).await);
    seed(&engine, "/kcs2/img.png", "abc123", b"cached").await;
    let url = format!("{}/kcs2/img.png?xyz999", mock_server.uri());

    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = Arc::clone(&engine);
        let url = url.clone();
        handles.push(tokio::spawn(async move {
            engine.lookup(&url, &LookupOptions::default()).await
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // the blob disappears while the origin is still answering
    tokio::fs::remove_file(temp_dir.path().join("content/kcs2/img.png"))
        .await
        .unwrap();

    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, CacheError::Io { .. }), "got {:?}", err);
    }
    assert_eq!(engine.in_flight(), 0);
    assert_eq!(engine.entry(&url).await.unwrap().unwrap().version, "abc123");
}

#[tokio::test]
async fn test_failed_blob_write_still_serves_waiters() {
    let mock_server = MockServer::start().await;
    let temp_dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/kcs2/img.png"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("fresh")
                .insert_header("last-modified", "Wed, 02 Oct 2024 00:00:00 GMT")
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let engine = Arc::new(create_test_engine(&temp_dir).await);
    engine
        .index()
        .insert(
            "/kcs2/img.png",
            CacheEntry {
                version: "old".to_string(),
                last_modified: Some(LAST_MODIFIED.to_string()),
                length: 6,
                cache_control: None,
            },
        )
        .await;
    // a non-empty directory where the blob belongs: the final rename fails
    let blob = temp_dir.path().join("content/kcs2/img.png");
    std::fs::create_dir_all(&blob).unwrap();
    std::fs::write(blob.join("keep"), b"x").unwrap();

    let url = format!("{}/kcs2/img.png?new", mock_server.uri());
    let mut handles = Vec::new();
    for _ in 0..3 {
        let engine = Arc::clone(&engine);
        let url = url.clone();
        handles.push(tokio::spawn(async move {
            engine.lookup(&url, &LookupOptions::default()).await
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for handle in handles {
        let resolved = handle.await.unwrap().unwrap();
        assert_eq!(resolved.status, 200);
        assert_eq!(resolved.contents, Some(Bytes::from_static(b"fresh")));
    }
    settle(&engine).await;

    let entry = engine.entry(&url).await.unwrap().unwrap();
    assert_eq!(entry.version, "old");
    assert_eq!(entry.last_modified.as_deref(), Some(LAST_MODIFIED));
    assert!(blob.is_dir());
}
