//! Integration tests for the fetch orchestrator.
//!
//! A scripted transport and a manual clock drive an in-memory SQLite store.
//! Tests cover fresh hits, conditional revalidation, forced refresh,
//! failure isolation, concurrency, encryption at rest, TTL sources,
//! invalidation and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use common::{
    cache, cache_with, network_error, not_modified, ok, ok_with_max_age, status, t0,
    FailingStore, ScriptedTransport,
};
use reval_cache::{
    cipher::generate_key_base64, BusMessage, CacheConfig, CacheError, Cipher, FetchOutcome,
    ManualClock, Method, Payload, ReactiveCache, RequestSpec, Staleness, UpdateBus, UpdateKind,
    UpdateSubscription,
};
use serde_json::json;

const URL: &str = "https://api.test/users";

/// Next bus message, or `None` if nothing arrives shortly.
async fn next_event(sub: &mut UpdateSubscription) -> Option<BusMessage> {
    tokio::time::timeout(Duration::from_millis(100), sub.recv())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn test_first_fetch_stores_entry_and_publishes_completed() {
    let transport = ScriptedTransport::new();
    transport.push(ok(r#"[{"id":1}]"#, Some("\"v1\"")));
    let (cache, _clock) = cache(transport.clone());
    let mut events = cache.bus().subscribe();

    let spec = RequestSpec::get(URL);
    let outcome = cache.fetch(&spec, false).await.unwrap();
    assert_eq!(outcome, FetchOutcome::Fetched);

    let key = spec.cache_key().unwrap();
    let (entry, staleness) = cache.orchestrator().peek(&key).await.unwrap().unwrap();
    assert_eq!(entry.payload, Payload::Plain(br#"[{"id":1}]"#.to_vec()));
    assert_eq!(entry.etag.as_deref(), Some("\"v1\""));
    assert_eq!(entry.timestamp, t0());
    assert_eq!(entry.ttl_secs, 300);
    assert!(!entry.is_stale);
    assert_eq!(staleness, Staleness::Fresh);

    match next_event(&mut events).await {
        Some(BusMessage::Event(event)) => {
            assert_eq!(event.key, key);
            assert_eq!(event.kind, UpdateKind::Completed);
        }
        other => panic!("expected Completed event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_fresh_entry_is_served_without_network_or_write() {
    let transport = ScriptedTransport::new();
    transport.push(ok("1", None));
    let (cache, clock) = cache(transport.clone());
    let spec = RequestSpec::get(URL);
    let key = spec.cache_key().unwrap();

    cache.fetch(&spec, false).await.unwrap();
    let mut feed = cache.orchestrator().store().subscribe();
    assert_eq!(feed.recv().await, Some(reval_cache::StoreChange::Snapshot));

    clock.advance(ChronoDuration::seconds(120));
    for _ in 0..3 {
        assert_eq!(
            cache.fetch(&spec, false).await.unwrap(),
            FetchOutcome::CacheHit
        );
    }

    assert_eq!(transport.calls(), 1);
    let (entry, _) = cache.orchestrator().peek(&key).await.unwrap().unwrap();
    assert_eq!(entry.timestamp, t0());
    assert!(
        tokio::time::timeout(Duration::from_millis(100), feed.recv())
            .await
            .is_err(),
        "cache hit must not write"
    );
}

#[tokio::test]
async fn test_stale_entry_revalidated_with_304() {
    let transport = ScriptedTransport::new();
    transport.push(ok(r#"{"name":"ada"}"#, Some("\"v1\"")));
    transport.push(not_modified());
    let (cache, clock) = cache(transport.clone());
    let spec = RequestSpec::get(URL).with_ttl(300);
    let key = spec.cache_key().unwrap();

    cache.fetch(&spec, false).await.unwrap();

    clock.advance(ChronoDuration::seconds(301));
    let (_, staleness) = cache.orchestrator().peek(&key).await.unwrap().unwrap();
    assert_eq!(staleness, Staleness::Stale);

    let outcome = cache.fetch(&spec, false).await.unwrap();
    assert_eq!(outcome, FetchOutcome::Revalidated);

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].if_none_match(), None);
    assert_eq!(requests[1].if_none_match(), Some("\"v1\""));

    let (entry, staleness) = cache.orchestrator().peek(&key).await.unwrap().unwrap();
    assert_eq!(entry.timestamp, t0() + ChronoDuration::seconds(301));
    assert!(!entry.is_stale);
    assert_eq!(staleness, Staleness::Fresh);
    assert_eq!(entry.payload.as_bytes(), br#"{"name":"ada"}"#);
    assert_eq!(entry.etag.as_deref(), Some("\"v1\""));
}

#[tokio::test]
async fn test_stale_entry_replaced_on_200() {
    let transport = ScriptedTransport::new();
    transport.push(ok("old", Some("\"v1\"")));
    transport.push(ok("new", Some("\"v2\"")));
    let (cache, clock) = cache(transport.clone());
    let spec = RequestSpec::get(URL).with_ttl(60);
    let key = spec.cache_key().unwrap();

    cache.fetch(&spec, false).await.unwrap();
    clock.advance(ChronoDuration::seconds(61));

    assert_eq!(
        cache.fetch(&spec, false).await.unwrap(),
        FetchOutcome::Fetched
    );
    let (entry, _) = cache.orchestrator().peek(&key).await.unwrap().unwrap();
    assert_eq!(entry.payload.as_bytes(), b"new");
    assert_eq!(entry.etag.as_deref(), Some("\"v2\""));
    assert_eq!(entry.timestamp, t0() + ChronoDuration::seconds(61));
}

#[tokio::test]
async fn test_forced_refresh_bypasses_fresh_entry() {
    let transport = ScriptedTransport::new();
    transport.push(ok("a", Some("\"v1\"")));
    transport.push(ok("b", Some("\"v2\"")));
    let (cache, _clock) = cache(transport.clone());
    let spec = RequestSpec::get(URL);

    cache.fetch(&spec, false).await.unwrap();
    assert_eq!(cache.fetch(&spec, true).await.unwrap(), FetchOutcome::Fetched);

    assert_eq!(transport.calls(), 2);
    assert_eq!(transport.requests()[1].if_none_match(), None);
}

#[tokio::test]
async fn test_transport_failure_leaves_entry_untouched() {
    let transport = ScriptedTransport::new();
    transport.push(ok("kept", Some("\"v1\"")));
    transport.push(network_error());
    transport.push(status(500));
    let (cache, clock) = cache(transport.clone());
    let spec = RequestSpec::get(URL).with_ttl(10);
    let key = spec.cache_key().unwrap();

    cache.fetch(&spec, false).await.unwrap();
    let (before, _) = cache.orchestrator().peek(&key).await.unwrap().unwrap();

    clock.advance(ChronoDuration::seconds(30));
    let mut events = cache.bus().subscribe();

    let err = cache.fetch(&spec, false).await.unwrap_err();
    assert!(matches!(err, CacheError::Transport { status: None, .. }));

    let err = cache.fetch(&spec, true).await.unwrap_err();
    assert_eq!(err.status(), Some(500));

    let (after, staleness) = cache.orchestrator().peek(&key).await.unwrap().unwrap();
    assert_eq!(after, before);
    assert_eq!(staleness, Staleness::Stale);
    assert!(next_event(&mut events).await.is_none());
}

#[tokio::test]
async fn test_unconditional_304_is_an_error() {
    let transport = ScriptedTransport::new();
    transport.push(not_modified());
    let (cache, _clock) = cache(transport.clone());
    let spec = RequestSpec::get(URL);

    let err = cache.fetch(&spec, false).await.unwrap_err();
    assert_eq!(err.status(), Some(304));
    assert!(cache
        .orchestrator()
        .peek(&spec.cache_key().unwrap())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_store_failure_publishes_nothing() {
    let transport = ScriptedTransport::new();
    transport.push(ok("x", None));
    let store = FailingStore::new();
    store.fail_writes(true);
    let cache = ReactiveCache::from_parts(
        store.clone(),
        transport.clone(),
        Arc::new(Cipher::disabled()),
        UpdateBus::default(),
        Arc::new(ManualClock::new(t0())),
        300,
    );
    let mut events = cache.bus().subscribe();

    let err = cache.fetch(&RequestSpec::get(URL), false).await.unwrap_err();
    assert_eq!(err.kind(), "store");
    assert!(next_event(&mut events).await.is_none());
}

#[tokio::test]
async fn test_concurrent_forced_fetches_leave_one_row() {
    let transport = ScriptedTransport::new();
    transport.push(ok("first", None));
    transport.push(ok("second", None));
    transport.set_delay(Duration::from_millis(20));
    let (cache, _clock) = cache(transport.clone());
    let spec = RequestSpec::get(URL);

    let (a, b) = tokio::join!(cache.fetch(&spec, true), cache.fetch(&spec, true));
    assert_eq!(a.unwrap(), FetchOutcome::Fetched);
    assert_eq!(b.unwrap(), FetchOutcome::Fetched);
    assert_eq!(transport.calls(), 2);

    let keys = cache.orchestrator().store().keys().await.unwrap();
    assert_eq!(keys, vec![spec.cache_key().unwrap()]);

    let (entry, _) = cache
        .orchestrator()
        .peek(&keys[0])
        .await
        .unwrap()
        .unwrap();
    assert!(entry.payload.as_bytes() == b"first" || entry.payload.as_bytes() == b"second");
}

#[tokio::test]
async fn test_concurrent_fetches_for_empty_key_share_one_request() {
    let transport = ScriptedTransport::new();
    transport.push(ok("only", None));
    transport.set_delay(Duration::from_millis(20));
    let (cache, _clock) = cache(transport.clone());
    let spec = RequestSpec::get(URL);

    let (a, b) = tokio::join!(cache.fetch(&spec, false), cache.fetch(&spec, false));
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| *o == FetchOutcome::Fetched);

    assert_eq!(outcomes, vec![FetchOutcome::CacheHit, FetchOutcome::Fetched]);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_timestamp_is_never_backdated() {
    let transport = ScriptedTransport::new();
    transport.push(ok("a", None));
    transport.push(ok("b", None));
    let (cache, clock) = cache(transport.clone());
    let spec = RequestSpec::get(URL);
    let key = spec.cache_key().unwrap();

    cache.fetch(&spec, false).await.unwrap();
    clock.set(t0() - ChronoDuration::minutes(10));
    cache.fetch(&spec, true).await.unwrap();

    let (entry, _) = cache.orchestrator().peek(&key).await.unwrap().unwrap();
    assert_eq!(entry.timestamp, t0());
    assert_eq!(entry.payload.as_bytes(), b"b");
}

#[tokio::test]
async fn test_ttl_sources() {
    let transport = ScriptedTransport::new();
    transport.push(ok_with_max_age("a", 5));
    transport.push(ok("b", None));
    transport.push(ok("c", None));
    let config = CacheConfig::in_memory().with_default_ttl(900);
    let (cache, _clock) = cache_with(config, transport.clone());

    let header_ttl = RequestSpec::get("https://api.test/a").with_ttl(60);
    let request_ttl = RequestSpec::get("https://api.test/b").with_ttl(60);
    let default_ttl = RequestSpec::get("https://api.test/c");

    for spec in [&header_ttl, &request_ttl, &default_ttl] {
        cache.fetch(spec, false).await.unwrap();
    }

    let ttl_of = |spec: &RequestSpec| {
        let key = spec.cache_key().unwrap();
        let orchestrator = Arc::clone(cache.orchestrator());
        async move { orchestrator.peek(&key).await.unwrap().unwrap().0.ttl_secs }
    };
    assert_eq!(ttl_of(&header_ttl).await, 5);
    assert_eq!(ttl_of(&request_ttl).await, 60);
    assert_eq!(ttl_of(&default_ttl).await, 900);
}

#[tokio::test]
async fn test_revalidation_takes_max_age_from_304() {
    let transport = ScriptedTransport::new();
    transport.push(ok("a", Some("\"v1\"")));
    let mut revalidated = reval_cache::TransportResponse::new(304);
    revalidated
        .headers
        .insert("cache-control", "max-age=600".parse().unwrap());
    transport.push(Ok(revalidated));
    let (cache, clock) = cache(transport.clone());
    let spec = RequestSpec::get(URL).with_ttl(30);

    cache.fetch(&spec, false).await.unwrap();
    clock.advance(ChronoDuration::seconds(31));
    cache.fetch(&spec, false).await.unwrap();

    let (entry, _) = cache
        .orchestrator()
        .peek(&spec.cache_key().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.ttl_secs, 600);
}

#[tokio::test]
async fn test_zero_ttl_always_revalidates() {
    let transport = ScriptedTransport::new();
    transport.push(ok("a", Some("\"v1\"")));
    transport.push(not_modified());
    let (cache, _clock) = cache(transport.clone());
    let spec = RequestSpec::get(URL).with_ttl(0);

    cache.fetch(&spec, false).await.unwrap();
    let (entry, staleness) = cache
        .orchestrator()
        .peek(&spec.cache_key().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(entry.is_stale);
    assert_eq!(staleness, Staleness::Stale);

    assert_eq!(
        cache.fetch(&spec, false).await.unwrap(),
        FetchOutcome::Revalidated
    );
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_encrypted_at_rest() {
    let transport = ScriptedTransport::new();
    transport.push(ok(r#"{"secret":true}"#, None));
    let (cache, _clock) = cache_with(
        CacheConfig::in_memory().with_encryption(true),
        transport.clone(),
    );
    let spec = RequestSpec::get(URL);
    let key = spec.cache_key().unwrap();

    cache.fetch(&spec, false).await.unwrap();
    let (entry, _) = cache.orchestrator().peek(&key).await.unwrap().unwrap();

    match &entry.payload {
        Payload::Encrypted { ciphertext, .. } => {
            assert_ne!(ciphertext.as_slice(), br#"{"secret":true}"#)
        }
        Payload::Plain(_) => panic!("expected encrypted payload"),
    }
    assert_eq!(
        cache.cipher().open(&key, &entry.payload).unwrap(),
        br#"{"secret":true}"#.to_vec()
    );

    cache.cipher().set_enabled(false).unwrap();
    let err = cache.cipher().open(&key, &entry.payload).unwrap_err();
    assert_eq!(err, CacheError::EncryptionUnavailable { key: key.clone() });
    assert!(cache.orchestrator().peek(&key).await.unwrap().is_some());
}

#[tokio::test]
async fn test_plaintext_entries_readable_after_enabling_encryption() {
    let transport = ScriptedTransport::new();
    transport.push(ok("plain", None));
    transport.push(ok("sealed", None));
    let config = CacheConfig::in_memory().with_encryption_key(generate_key_base64());
    let (cache, _clock) = cache_with(config, transport.clone());
    let plain = RequestSpec::get("https://api.test/plain");
    let sealed = RequestSpec::get("https://api.test/sealed");

    cache.fetch(&plain, false).await.unwrap();
    cache.cipher().set_enabled(true).unwrap();
    cache.fetch(&sealed, false).await.unwrap();

    for (spec, body) in [(&plain, &b"plain"[..]), (&sealed, &b"sealed"[..])] {
        let key = spec.cache_key().unwrap();
        let (entry, _) = cache.orchestrator().peek(&key).await.unwrap().unwrap();
        assert_eq!(entry.is_encrypted(), spec.url.ends_with("sealed"));
        assert_eq!(cache.cipher().open(&key, &entry.payload).unwrap(), body);
    }
}

#[tokio::test]
async fn test_invalidate_absent_key_succeeds() {
    let transport = ScriptedTransport::new();
    let (cache, _clock) = cache(transport.clone());
    let mut events = cache.bus().subscribe();
    let spec = RequestSpec::get(URL);

    assert!(!cache.invalidate(&spec).await.unwrap());
    match next_event(&mut events).await {
        Some(BusMessage::Event(event)) => assert_eq!(event.kind, UpdateKind::Invalidated),
        other => panic!("expected Invalidated event, got {:?}", other),
    }
    assert!(next_event(&mut events).await.is_none());
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_invalidate_then_fetch_goes_to_network() {
    let transport = ScriptedTransport::new();
    transport.push(ok("a", Some("\"v1\"")));
    transport.push(ok("b", None));
    let (cache, _clock) = cache(transport.clone());
    let spec = RequestSpec::get(URL);

    cache.fetch(&spec, false).await.unwrap();
    assert!(cache.invalidate(&spec).await.unwrap());
    assert_eq!(cache.fetch(&spec, false).await.unwrap(), FetchOutcome::Fetched);

    assert_eq!(transport.calls(), 2);
    assert_eq!(transport.requests()[1].if_none_match(), None);
}

#[tokio::test]
async fn test_clear_invalidates_every_key() {
    let transport = ScriptedTransport::new();
    transport.push(ok("a", None));
    transport.push(ok("b", None));
    let (cache, _clock) = cache(transport.clone());

    cache
        .fetch(&RequestSpec::get("https://api.test/a"), false)
        .await
        .unwrap();
    cache
        .fetch(&RequestSpec::get("https://api.test/b"), false)
        .await
        .unwrap();

    let mut events = cache.bus().subscribe();
    assert_eq!(cache.clear().await.unwrap(), 2);

    let mut invalidated = Vec::new();
    while let Some(BusMessage::Event(event)) = next_event(&mut events).await {
        assert_eq!(event.kind, UpdateKind::Invalidated);
        invalidated.push(event.key);
    }
    invalidated.sort();
    assert_eq!(
        invalidated,
        vec!["GET https://api.test/a", "GET https://api.test/b"]
    );
    assert!(cache.orchestrator().store().keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_equivalent_bodies_share_an_entry() {
    let transport = ScriptedTransport::new();
    transport.push(ok("hits", None));
    let (cache, _clock) = cache(transport.clone());

    let a = RequestSpec::new(Method::POST, "https://api.test/search")
        .json_body(&json!({"q": "rust", "page": 1}))
        .unwrap();
    let b = RequestSpec::new(Method::POST, "https://api.test/search")
        .json_body(&json!({"page": 1, "q": "rust"}))
        .unwrap();

    assert_eq!(a.cache_key().unwrap(), b.cache_key().unwrap());
    cache.fetch(&a, false).await.unwrap();
    assert_eq!(cache.fetch(&b, false).await.unwrap(), FetchOutcome::CacheHit);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_operations_after_shutdown_fail() {
    let transport = ScriptedTransport::new();
    let (cache, _clock) = cache(transport.clone());
    let spec = RequestSpec::get(URL);

    cache.shutdown();
    assert!(cache.is_shut_down());

    assert!(matches!(
        cache.fetch(&spec, false).await,
        Err(CacheError::NotInitialized { .. })
    ));
    assert!(matches!(
        cache.invalidate(&spec).await,
        Err(CacheError::NotInitialized { .. })
    ));
    assert!(matches!(
        cache.resource::<serde_json::Value>(spec),
        Err(CacheError::NotInitialized { .. })
    ));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_rejected_body_is_not_stored() {
    let transport = ScriptedTransport::new();
    transport.push(ok(r#"{"id":1}"#, Some("\"v1\"")));
    transport.push(ok("<html>oops</html>", Some("\"v2\"")));
    let (cache, _clock) = cache(transport.clone());
    let spec = RequestSpec::get(URL);
    let key = spec.cache_key().unwrap();

    cache.fetch(&spec, false).await.unwrap();
    let mut events = cache.bus().subscribe();

    let only_json = |bytes: &[u8]| -> reval_cache::CacheResult<()> {
        serde_json::from_slice::<serde_json::Value>(bytes)
            .map(|_| ())
            .map_err(|e| CacheError::Decoding {
                message: e.to_string(),
            })
    };
    let err = cache
        .orchestrator()
        .fetch_with(&spec, true, &only_json)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "decoding");

    let (entry, _) = cache.orchestrator().peek(&key).await.unwrap().unwrap();
    assert_eq!(entry.payload, Payload::Plain(br#"{"id":1}"#.to_vec()));
    assert_eq!(entry.etag.as_deref(), Some("\"v1\""));
    assert_eq!(next_event(&mut events).await, None);
    assert_eq!(transport.calls(), 2);
}
