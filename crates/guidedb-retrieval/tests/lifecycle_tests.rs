mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use guidedb_core::types::{Degradation, IndexStatus};
use tempfile::TempDir;

const GUIDE: &str = "snes/zelda/guide_walkthrough";

#[tokio::test]
async fn transient_failures_are_retried() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(MemoryStore::default());
    store.put(GUIDE, GAME, small_text(1));
    let embedder = ControlledEmbedder::new();
    let svc = start(settings(tmp.path()), &store, &TestLoader::new(embedder.clone(), "test:v1")).await;

    embedder.fail_next.store(1, Ordering::SeqCst);
    assert_eq!(svc.index_guide(GUIDE).await?, IndexStatus::Indexed);
    assert_eq!(embedder.calls(), 2);
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_settle_in_failed_until_retriggered() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(MemoryStore::default());
    store.put(GUIDE, GAME, small_text(1));
    let embedder = ControlledEmbedder::new();
    let mut s = settings(tmp.path());
    s.retrieval.failed_cooldown_secs = 3600;
    let svc = start(s, &store, &TestLoader::new(embedder.clone(), "test:v1")).await;

    embedder.fail_next.store(100, Ordering::SeqCst);
    assert_eq!(svc.index_guide(GUIDE).await?, IndexStatus::Failed);
    assert_eq!(embedder.calls(), 3, "one attempt plus two retries");
    assert_eq!(svc.game_status(GAME)?, IndexStatus::Failed);

    // Still cooling down: retrieval does not start another job.
    let result = svc.retrieve(GAME, "tower", 3, 2000).await?;
    assert_eq!(result.degraded, Some(Degradation::NotIndexed));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(svc.index_status(GUIDE), IndexStatus::Failed);

    embedder.fail_next.store(0, Ordering::SeqCst);
    assert_eq!(svc.index_guide(GUIDE).await?, IndexStatus::Indexed);
    Ok(())
}

#[tokio::test]
async fn failed_guides_are_retried_by_retrieval_after_cooldown() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(MemoryStore::default());
    store.put(GUIDE, GAME, small_text(1));
    let embedder = ControlledEmbedder::new();
    let mut s = settings(tmp.path());
    s.retrieval.failed_cooldown_secs = 0;
    let svc = start(s, &store, &TestLoader::new(embedder.clone(), "test:v1")).await;

    embedder.fail_next.store(100, Ordering::SeqCst);
    assert_eq!(svc.index_guide(GUIDE).await?, IndexStatus::Failed);

    embedder.fail_next.store(0, Ordering::SeqCst);
    let result = svc.retrieve(GAME, "tower", 3, 2000).await?;
    assert!(result.is_empty());
    wait_for_status(&svc, GUIDE, IndexStatus::Indexed).await;
    Ok(())
}

#[tokio::test]
async fn chunking_errors_fail_without_retry() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(MemoryStore::default());
    store.put(GUIDE, GAME, "bad\0text".to_string());
    let embedder = ControlledEmbedder::new();
    let svc = start(settings(tmp.path()), &store, &TestLoader::new(embedder.clone(), "test:v1")).await;

    assert_eq!(svc.index_guide(GUIDE).await?, IndexStatus::Failed);
    assert_eq!(embedder.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn unknown_guides_are_not_found() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(MemoryStore::default());
    let svc = start(settings(tmp.path()), &store, &TestLoader::new(ControlledEmbedder::new(), "test:v1")).await;
    assert!(svc.index_guide("snes/zelda/guide_missing").await.is_err());
    assert_eq!(svc.index_status("snes/zelda/guide_missing"), IndexStatus::NotIndexed);
    Ok(())
}

#[tokio::test]
async fn missing_model_degrades_then_recovers() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(MemoryStore::default());
    store.put(GUIDE, GAME, small_text(1));
    let loader = TestLoader::new(ControlledEmbedder::new(), "test:v1");
    loader.broken.store(true, Ordering::SeqCst);

    let svc = start(settings(tmp.path()), &store, &loader).await;
    assert!(!svc.model_ready());
    assert_eq!(loader.loads.load(Ordering::SeqCst), 3, "startup load is retried with backoff");

    let result = svc.retrieve(GAME, "tower", 3, 2000).await?;
    assert_eq!(result.degraded, Some(Degradation::ModelUnavailable));
    wait_for_status(&svc, GUIDE, IndexStatus::Failed).await;

    loader.broken.store(false, Ordering::SeqCst);
    assert_eq!(svc.index_guide(GUIDE).await?, IndexStatus::Indexed);
    assert!(svc.model_ready());
    assert!(svc.retrieve(GAME, "tower", 3, 2000).await?.is_complete());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deleting_mid_index_cancels_the_job() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(MemoryStore::default());
    store.put(GUIDE, GAME, guide_text(7000, 100));
    let embedder = ControlledEmbedder::new();
    embedder.delay_ms.store(30, Ordering::SeqCst);
    let mut s = settings(tmp.path());
    s.retrieval.index_batch = 2;
    s.embedding.max_batch = 2;
    let svc = Arc::new(start(s, &store, &TestLoader::new(embedder.clone(), "test:v1")).await);

    let job = tokio::spawn({
        let svc = svc.clone();
        async move { svc.index_guide(GUIDE).await }
    });
    while embedder.calls() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    store.remove(GUIDE);
    svc.delete_guide_index(GUIDE).await?;
    let after_delete = embedder.calls();

    assert_eq!(job.await??, IndexStatus::NotIndexed);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(embedder.calls(), after_delete, "no embedding after cancellation");
    assert!(after_delete < 20, "job stopped well before its ~39 chunks");
    assert!(svc.index().guide_entries(GUIDE).is_empty());
    assert_eq!(svc.index_status(GUIDE), IndexStatus::NotIndexed);
    assert!(svc.index().is_consistent());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn games_index_independently() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(MemoryStore::default());
    store.put("snes/earthbound/guide_long", "EarthBound", guide_text(7000, 100));
    store.put(GUIDE, GAME, small_text(1));
    let embedder = ControlledEmbedder::new();
    embedder.delay_ms.store(30, Ordering::SeqCst);
    let mut s = settings(tmp.path());
    s.retrieval.index_batch = 2;
    s.embedding.max_batch = 2;
    let svc = Arc::new(start(s, &store, &TestLoader::new(embedder.clone(), "test:v1")).await);

    let slow = tokio::spawn({
        let svc = svc.clone();
        async move { svc.index_guide("snes/earthbound/guide_long").await }
    });
    while embedder.calls() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(svc.index_guide(GUIDE).await?, IndexStatus::Indexed);
    assert_eq!(svc.index_status("snes/earthbound/guide_long"), IndexStatus::Indexing, "the other game is still running");

    assert_eq!(slow.await??, IndexStatus::Indexed);
    svc.shutdown().await?;
    let reopened = start(settings(tmp.path()), &store, &TestLoader::new(ControlledEmbedder::new(), "test:v1")).await;
    assert_eq!(reopened.index_status(GUIDE), IndexStatus::Indexed);
    assert_eq!(reopened.index_status("snes/earthbound/guide_long"), IndexStatus::Indexed);
    Ok(())
}

#[tokio::test]
async fn second_trigger_joins_the_running_job() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(MemoryStore::default());
    store.put(GUIDE, GAME, guide_text(1200, 600));
    let embedder = ControlledEmbedder::new();
    embedder.delay_ms.store(10, Ordering::SeqCst);
    let svc = start(settings(tmp.path()), &store, &TestLoader::new(embedder.clone(), "test:v1")).await;

    let (a, b) = tokio::join!(svc.index_guide(GUIDE), svc.index_guide(GUIDE));
    assert_eq!(a?, IndexStatus::Indexed);
    assert_eq!(b?, IndexStatus::Indexed);
    assert_eq!(embedder.texts(), svc.index().guide_chunk_ids(GUIDE).len(), "every chunk embedded once");
    Ok(())
}

#[tokio::test]
async fn restart_restores_index_and_statuses() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(MemoryStore::default());
    store.put(GUIDE, GAME, guide_text(800, 300));
    {
        let svc = start(settings(tmp.path()), &store, &TestLoader::new(ControlledEmbedder::new(), "test:v1")).await;
        svc.index_guide(GUIDE).await?;
        svc.shutdown().await?;
    }

    let embedder = ControlledEmbedder::new();
    let svc = start(settings(tmp.path()), &store, &TestLoader::new(embedder.clone(), "test:v1")).await;
    assert_eq!(svc.index_status(GUIDE), IndexStatus::Indexed);
    let result = svc.retrieve(GAME, QUERY, 3, 2000).await?;
    assert!(result.is_complete());
    assert!(result.passages.iter().any(|p| p.text.contains("Moonstone")));
    assert_eq!(embedder.texts(), 1, "only the query was embedded");
    Ok(())
}

#[tokio::test]
async fn model_version_change_rebuilds_the_index() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(MemoryStore::default());
    store.put(GUIDE, GAME, guide_text(800, 300));
    let old_chunks = {
        let svc = start(settings(tmp.path()), &store, &TestLoader::new(ControlledEmbedder::new(), "test:v1")).await;
        svc.index_guide(GUIDE).await?;
        svc.shutdown().await?;
        svc.index().len()
    };

    let embedder = ControlledEmbedder::new();
    let svc = start(settings(tmp.path()), &store, &TestLoader::new(embedder.clone(), "test:v2")).await;
    assert!(svc.index().is_empty(), "stale entries are not served");
    assert_eq!(svc.index_status(GUIDE), IndexStatus::NotIndexed);
    assert!(svc.cache().is_empty());

    let first = svc.retrieve(GAME, QUERY, 3, 2000).await?;
    assert_eq!(first.degraded, Some(Degradation::NotIndexed));
    wait_for_status(&svc, GUIDE, IndexStatus::Indexed).await;
    assert_eq!(svc.index().len(), old_chunks);
    assert_eq!(svc.index().model_version(), "test:v2");
    assert_eq!(embedder.texts(), old_chunks, "every chunk re-embedded under the new model");
    svc.shutdown().await?;

    let reopened = start(settings(tmp.path()), &store, &TestLoader::new(ControlledEmbedder::new(), "test:v2")).await;
    assert_eq!(reopened.index().len(), old_chunks);
    Ok(())
}

#[tokio::test]
async fn index_all_covers_every_game() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let store = Arc::new(MemoryStore::default());
    store.put("snes/zelda/guide_1", "zelda", small_text(1));
    store.put("snes/earthbound/guide_1", "EarthBound", small_text(2));
    store.put("snes/earthbound/guide_2", "EarthBound", small_text(3));
    let svc = start(settings(tmp.path()), &store, &TestLoader::new(ControlledEmbedder::new(), "test:v1")).await;

    let outcomes = svc.index_all().await?;
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|(_, r)| matches!(r, Ok(IndexStatus::Indexed))));
    assert_eq!(svc.index().game_len("earthbound"), 2);
    assert_eq!(svc.game_status("Earthbound")?, IndexStatus::Indexed);
    Ok(())
}
