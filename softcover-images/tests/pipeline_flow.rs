mod common;

use std::time::Duration;

use common::{
    FakeTransport, Route, eventually, jpeg, locator, pipeline, png_with_alpha,
};
use futures::StreamExt;
use softcover_images::{
    CacheKey, ImageRequest, LoadError, LoadPhase, NetworkError, TransformSpec,
    units::ByteSize,
};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

const COVER: &str = "https://assets.example.com/covers/1.jpg";
const OTHER: &str = "https://assets.example.com/covers/2.jpg";

fn request(url: &str, spec: TransformSpec) -> ImageRequest {
    ImageRequest::new(locator(url), spec)
}

#[tokio::test]
async fn concurrent_loads_share_one_fetch() {
    let dir = tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(COVER, Route::Body(jpeg(400, 600)));
    transport.hold(COVER);
    let pipeline = pipeline(dir.path(), &transport);

    // Different sizes, same address: one network fetch.
    let mut handles: Vec<_> = (1..=5)
        .map(|n| {
            let spec = TransformSpec::pixels(n * 40, 1);
            pipeline.load(request(COVER, spec))
        })
        .collect();

    eventually(|| pipeline.stats().coalescer.waiters == 4).await;
    transport.release(COVER);

    for (n, handle) in handles.iter_mut().enumerate() {
        let phase = handle.wait().await;
        let image = phase.image().expect("success");
        let bound = (n as u32 + 1) * 40;
        assert_eq!(image.height(), bound);
    }
    assert_eq!(transport.calls(COVER), 1);
    assert_eq!(pipeline.stats().coalescer.in_flight, 0);
}

#[tokio::test]
async fn second_load_is_served_synchronously_from_memory() {
    let dir = tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(COVER, Route::Body(jpeg(300, 300)));
    let pipeline = pipeline(dir.path(), &transport);
    let spec = TransformSpec::points(50, 2);

    let first = pipeline.load(request(COVER, spec)).wait().await;
    assert_eq!(first.image().unwrap().dimensions(), (100, 100));

    let handle = pipeline.load(request(COVER, spec));
    let LoadPhase::Success(again) = handle.phase() else {
        panic!("expected an immediate memory hit");
    };
    assert!(again.ptr_eq(first.image().unwrap()));
    assert_eq!(transport.total_calls(), 1);
}

#[tokio::test]
async fn disk_tiers_survive_a_restart() {
    let dir = tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(COVER, Route::Body(jpeg(400, 200)));

    {
        let warm = pipeline(dir.path(), &transport);
        let phase = warm
            .load(request(COVER, TransformSpec::pixels(100, 1)))
            .wait()
            .await;
        assert!(phase.image().is_some());
    }

    // Fresh process: empty memory, network now failing.
    let offline = FakeTransport::new();
    let cold = pipeline(dir.path(), &offline);

    let processed = cold
        .load(request(COVER, TransformSpec::pixels(100, 1)))
        .wait()
        .await;
    assert_eq!(processed.image().unwrap().dimensions(), (100, 50));

    // A new size is cut from the stored original.
    let resized = cold
        .load(request(COVER, TransformSpec::pixels(40, 1)))
        .wait()
        .await;
    assert_eq!(resized.image().unwrap().dimensions(), (40, 20));
    assert_eq!(offline.total_calls(), 0);
    assert!(cold.stats().disk.hits >= 2);
}

#[tokio::test]
async fn network_failure_surfaces_after_retries() {
    let dir = tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(COVER, Route::Status(503));
    let pipeline = pipeline(dir.path(), &transport);

    let phase = pipeline
        .load(request(COVER, TransformSpec::points(80, 2)))
        .wait()
        .await;

    match phase {
        LoadPhase::Failure(LoadError::Network(NetworkError::Status {
            status,
            ..
        })) => assert_eq!(status, 503),
        other => panic!("unexpected phase {other:?}"),
    }
    // retry_count = 1: first try plus one retry.
    assert_eq!(transport.calls(COVER), 2);
}

#[tokio::test]
async fn undecodable_bytes_fail_with_decode_error() {
    let dir = tempdir().unwrap();
    let transport = FakeTransport::new();
    let html = bytes::Bytes::from_static(b"<html>nope</html>");
    transport.route(COVER, Route::Body(html));
    let pipeline = pipeline(dir.path(), &transport);

    let phase = pipeline
        .load(request(COVER, TransformSpec::points(80, 2)))
        .wait()
        .await;
    assert!(matches!(phase, LoadPhase::Failure(LoadError::Decode(_))));
}

#[tokio::test]
async fn retargeted_loader_discards_the_stale_result() {
    let dir = tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(COVER, Route::Body(jpeg(120, 120)));
    transport.route(OTHER, Route::Body(jpeg(60, 30)));
    transport.hold(COVER);
    let pipeline = pipeline(dir.path(), &transport);
    let spec = TransformSpec::original(1);

    let loader = pipeline.loader();
    let mut phases = loader.subscribe();
    loader.update(request(COVER, spec));
    eventually(|| transport.calls(COVER) == 1).await;

    loader.update(request(OTHER, spec));
    loop {
        if let LoadPhase::Success(image) = &*phases.borrow_and_update() {
            assert_eq!(image.dimensions(), (60, 30));
            break;
        }
        phases.changed().await.unwrap();
    }

    transport.release(COVER);
    eventually(|| pipeline.stats().coalescer.in_flight == 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(loader.phase().image().unwrap().dimensions(), (60, 30));
}

#[tokio::test]
async fn update_with_the_same_request_is_a_no_op() {
    let dir = tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(COVER, Route::Body(jpeg(64, 64)));
    let pipeline = pipeline(dir.path(), &transport);
    let req = request(COVER, TransformSpec::points(16, 2));

    let loader = pipeline.loader();
    let mut phases = loader.subscribe();
    loader.update(req.clone());
    while !phases.borrow_and_update().is_terminal() {
        phases.changed().await.unwrap();
    }

    loader.update(req.clone());
    assert!(!phases.has_changed().unwrap());
    assert!(loader.phase().image().is_some());
    assert_eq!(transport.total_calls(), 1);

    // After a cancel the same request runs again (from memory).
    loader.cancel();
    loader.update(req);
    assert!(loader.phase().image().is_some());
    assert_eq!(transport.total_calls(), 1);
}

#[tokio::test]
async fn progress_loads_stream_and_bypass_the_coalescer() {
    let dir = tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(COVER, Route::Body(png_with_alpha(200, 100)));
    let pipeline = pipeline(dir.path(), &transport);

    let spec = TransformSpec::pixels(50, 1);
    let handle = pipeline.load_with_progress(request(COVER, spec));
    let phases: Vec<LoadPhase> = handle
        .into_stream()
        .take_while(|p| futures::future::ready(!p.is_terminal()))
        .collect()
        .await;

    let mut last = 0.0;
    for phase in &phases {
        if let LoadPhase::Progress(p) = phase {
            assert!((0.0..=1.0).contains(p));
            assert!(*p >= last);
            last = *p;
        }
    }
    assert_eq!(transport.stream_calls(), 1);
    assert_eq!(pipeline.stats().coalescer.leaders, 0);

    let cached = pipeline
        .memory()
        .get(&CacheKey::processed(&locator(COVER), &spec))
        .unwrap();
    assert_eq!(cached.dimensions(), (50, 25));
    assert!(cached.has_alpha());
}

#[tokio::test]
async fn prefetch_is_sequential_and_silent() {
    let dir = tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(COVER, Route::Body(jpeg(90, 90)));
    transport.route(OTHER, Route::Body(jpeg(90, 90)));
    let missing = "https://assets.example.com/covers/404.jpg";
    let pipeline = pipeline(dir.path(), &transport);
    let spec = TransformSpec::points(30, 1);

    let warmed = pipeline
        .prefetch(
            [locator(COVER), locator(missing), locator(OTHER)],
            spec,
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(warmed, 2);

    for url in [COVER, OTHER] {
        let handle = pipeline.load(request(url, spec));
        assert!(handle.phase().image().is_some());
    }
}

#[tokio::test]
async fn cancelled_prefetch_does_nothing() {
    let dir = tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(COVER, Route::Body(jpeg(90, 90)));
    let pipeline = pipeline(dir.path(), &transport);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let warmed = pipeline
        .prefetch([locator(COVER)], TransformSpec::points(30, 1), &cancel)
        .await;
    assert_eq!(warmed, 0);
    assert_eq!(transport.total_calls(), 0);
}

#[tokio::test]
async fn invalidate_forces_a_refetch() {
    let dir = tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(COVER, Route::Body(jpeg(100, 100)));
    let pipeline = pipeline(dir.path(), &transport);
    let spec = TransformSpec::points(20, 2);
    let loc = locator(COVER);

    pipeline.load(request(COVER, spec)).wait().await;
    pipeline.invalidate(&loc, Some(&spec)).await;

    assert_eq!(pipeline.memory().stats().entries, 0);
    for key in [CacheKey::original(&loc), CacheKey::processed(&loc, &spec)] {
        let hex = key.digest().to_hex();
        assert!(!dir.path().join(format!("{hex}.bin")).exists());
        assert!(!dir.path().join(format!("{hex}.img")).exists());
    }

    let phase = pipeline.load(request(COVER, spec)).wait().await;
    assert!(phase.image().is_some());
    assert_eq!(transport.calls(COVER), 2);
}

#[tokio::test]
async fn invalidate_without_a_size_drops_every_variant() {
    let dir = tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(COVER, Route::Body(jpeg(100, 100)));
    let pipeline = pipeline(dir.path(), &transport);
    let full = TransformSpec::original(2);
    let small = TransformSpec::pixels(40, 1);

    pipeline.load(request(COVER, full)).wait().await;
    pipeline.load(request(COVER, small)).wait().await;
    assert_eq!(transport.calls(COVER), 1);

    transport.route(COVER, Route::Body(jpeg(50, 30)));
    pipeline.invalidate(&locator(COVER), None).await;

    let phase = pipeline.load(request(COVER, full)).wait().await;
    assert_eq!(phase.image().unwrap().dimensions(), (50, 30));
    assert_eq!(transport.calls(COVER), 2);

    // Cut from the refreshed original, not the stale variant.
    let phase = pipeline.load(request(COVER, small)).wait().await;
    assert_eq!(phase.image().unwrap().dimensions(), (40, 24));
    assert_eq!(transport.calls(COVER), 2);
}

#[tokio::test]
async fn invalidate_reaches_variants_cached_before_a_restart() {
    let dir = tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(COVER, Route::Body(jpeg(100, 100)));
    let spec = TransformSpec::points(30, 2);

    {
        let warm = pipeline(dir.path(), &transport);
        warm.load(request(COVER, spec)).wait().await;
    }

    transport.route(COVER, Route::Body(jpeg(120, 60)));
    let cold = pipeline(dir.path(), &transport);
    cold.invalidate(&locator(COVER), None).await;

    let phase = cold.load(request(COVER, spec)).wait().await;
    assert_eq!(phase.image().unwrap().dimensions(), (60, 30));
    assert_eq!(transport.calls(COVER), 2);
}

#[tokio::test]
async fn cancelled_handle_stops_waiting() {
    let dir = tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(COVER, Route::Body(jpeg(64, 64)));
    transport.hold(COVER);
    let pipeline = pipeline(dir.path(), &transport);

    let spec = TransformSpec::pixels(32, 1);
    let mut handle = pipeline.load(request(COVER, spec));
    eventually(|| transport.calls(COVER) == 1).await;
    handle.cancel();

    let phase = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .expect("wait returns after cancel");
    assert!(!phase.is_terminal());
    let next = tokio::time::timeout(Duration::from_secs(2), handle.changed())
        .await
        .expect("changed returns after cancel");
    assert!(next.is_none());

    transport.release(COVER);
    eventually(|| pipeline.stats().coalescer.in_flight == 0).await;
    assert!(!handle.phase().is_terminal());
}

#[tokio::test]
async fn clear_all_and_memory_pressure_empty_the_tiers() {
    let dir = tempdir().unwrap();
    let transport = FakeTransport::new();
    transport.route(COVER, Route::Body(jpeg(100, 100)));
    let pipeline = pipeline(dir.path(), &transport);
    let spec = TransformSpec::points(20, 2);

    pipeline.load(request(COVER, spec)).wait().await;
    assert_eq!(pipeline.memory().stats().entries, 1);
    pipeline.handle_memory_pressure();
    assert_eq!(pipeline.memory().stats().entries, 0);

    // Still on disk.
    pipeline.load(request(COVER, spec)).wait().await;
    assert_eq!(transport.total_calls(), 1);

    pipeline.clear_all().await;
    assert_eq!(pipeline.memory().stats().entries, 0);
    assert_eq!(pipeline.disk().usage_bytes().await, ByteSize::ZERO);
}

#[tokio::test]
async fn configure_disk_cache_applies_floors() {
    let dir = tempdir().unwrap();
    let transport = FakeTransport::new();
    let pipeline = pipeline(dir.path(), &transport);

    pipeline.configure_disk_cache(Duration::from_secs(5), 0).await;
    let limits = pipeline.disk().limits();
    assert_eq!(limits.ttl, Duration::from_secs(60));
    assert_eq!(limits.max_bytes, ByteSize::from_mib(1));

    pipeline.configure_disk_cache(Duration::from_secs(3600), 50).await;
    let limits = pipeline.disk().limits();
    assert_eq!(limits.ttl, Duration::from_secs(3600));
    assert_eq!(limits.max_bytes, ByteSize::from_mib(50));
}
