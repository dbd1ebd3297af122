use guidedb_core::error::Error;
use guidedb_vector::table;
use guidedb_vector::{IndexEntry, VectorIndex};
use tempfile::TempDir;

const TABLE: &str = "index_entries";

fn entry(game: &str, guide: &str, n: usize, v: Vec<f32>) -> IndexEntry {
    IndexEntry {
        chunk_id: format!("{guide}#{n}"),
        guide_id: guide.into(),
        game_id: game.into(),
        content_hash: format!("hash-{guide}-{n}"),
        source: format!("guides/{guide}.md"),
        text: format!("passage {n} from {guide}"),
        vector: v,
    }
}

fn seeded(version: &str) -> VectorIndex {
    let idx = VectorIndex::new(4, version, 0.25);
    idx.add_many(vec![
        entry("zelda", "snes/zelda/guide_1", 0, vec![1.0, 0.0, 0.0, 0.0]),
        entry("zelda", "snes/zelda/guide_1", 1, vec![0.0, 1.0, 0.0, 0.0]),
        entry("earthbound", "snes/earthbound/guide_2", 0, vec![0.0, 0.0, 1.0, 0.0]),
    ])
    .unwrap();
    idx
}

#[tokio::test]
async fn persist_then_load_restores_entries() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let conn = table::open_db(&tmp.path().to_string_lossy()).await?;
    let idx = seeded("hash:d4");
    assert_eq!(idx.persist(&conn, TABLE).await?, 3);

    let loaded = VectorIndex::load(&conn, TABLE, "hash:d4", 4, 0.25).await?;
    assert_eq!(loaded.len(), 3);
    assert!(loaded.is_consistent());
    assert_eq!(loaded.entry("snes/zelda/guide_1#1"), idx.entry("snes/zelda/guide_1#1"));
    assert_eq!(
        loaded.search("zelda", &[1.0, 0.0, 0.0, 0.0], 1)?,
        idx.search("zelda", &[1.0, 0.0, 0.0, 0.0], 1)?
    );
    Ok(())
}

#[tokio::test]
async fn persist_replaces_previous_rows() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let conn = table::open_db(&tmp.path().to_string_lossy()).await?;
    let idx = seeded("hash:d4");
    idx.persist(&conn, TABLE).await?;
    idx.remove_guide("snes/zelda/guide_1");
    idx.persist(&conn, TABLE).await?;

    let loaded = VectorIndex::load(&conn, TABLE, "hash:d4", 4, 0.25).await?;
    assert_eq!(loaded.len(), 1);
    assert!(loaded.guide_entries("snes/zelda/guide_1").is_empty());
    Ok(())
}

#[tokio::test]
async fn model_version_change_is_detected() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let conn = table::open_db(&tmp.path().to_string_lossy()).await?;
    seeded("hash:d4").persist(&conn, TABLE).await?;

    let err = VectorIndex::load(&conn, TABLE, "bge-m3:d4", 4, 0.25).await.err();
    assert!(matches!(err, Some(Error::IndexInconsistency(_))), "{err:?}");

    // Rebuilding under the new model overwrites the stale rows.
    let fresh = VectorIndex::new(4, "bge-m3:d4", 0.25);
    fresh.add(entry("zelda", "snes/zelda/guide_1", 0, vec![0.5, 0.5, 0.0, 0.0]))?;
    fresh.persist(&conn, TABLE).await?;
    let loaded = VectorIndex::load(&conn, TABLE, "bge-m3:d4", 4, 0.25).await?;
    assert_eq!(loaded.len(), 1);
    Ok(())
}

#[tokio::test]
async fn new_vector_width_rotates_the_table() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let conn = table::open_db(&tmp.path().to_string_lossy()).await?;
    seeded("hash:d4").persist(&conn, TABLE).await?;

    assert!(matches!(VectorIndex::load(&conn, TABLE, "hash:d4", 8, 0.25).await, Err(Error::IndexInconsistency(_))));

    let wide = VectorIndex::new(8, "hash:d8", 0.25);
    let mut v = vec![0.0; 8];
    v[7] = 1.0;
    wide.add(entry("zelda", "snes/zelda/guide_1", 0, v))?;
    wide.persist(&conn, TABLE).await?;
    assert_eq!(VectorIndex::load(&conn, TABLE, "hash:d8", 8, 0.25).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn missing_table_loads_empty() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let conn = table::open_db(&tmp.path().to_string_lossy()).await?;
    let idx = VectorIndex::load(&conn, TABLE, "hash:d4", 4, 0.25).await?;
    assert!(idx.is_empty());
    Ok(())
}

fn chunk_ids(idx: &VectorIndex, guide: &str) -> Vec<String> {
    let mut ids = idx.guide_chunk_ids(guide);
    ids.sort();
    ids
}

#[tokio::test]
async fn guide_writes_leave_other_guides_alone() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let conn = table::open_db(&tmp.path().to_string_lossy()).await?;
    let idx = seeded("hash:d4");
    idx.persist(&conn, TABLE).await?;

    idx.remove("snes/zelda/guide_1#1");
    idx.add(entry("zelda", "snes/zelda/guide_1", 2, vec![0.0, 0.0, 0.0, 1.0]))?;
    idx.remove_guide("snes/earthbound/guide_2");
    assert_eq!(idx.persist_guides(&conn, TABLE, &["snes/zelda/guide_1".to_string()]).await?, 2);

    let loaded = VectorIndex::load(&conn, TABLE, "hash:d4", 4, 0.25).await?;
    assert_eq!(chunk_ids(&loaded, "snes/zelda/guide_1"), vec!["snes/zelda/guide_1#0", "snes/zelda/guide_1#2"]);
    assert_eq!(loaded.game_len("earthbound"), 1, "not written yet");

    assert_eq!(idx.persist_guides(&conn, TABLE, &["snes/earthbound/guide_2".to_string()]).await?, 0);
    let loaded = VectorIndex::load(&conn, TABLE, "hash:d4", 4, 0.25).await?;
    assert_eq!(loaded.game_len("earthbound"), 0);
    assert_eq!(loaded.len(), 2);
    Ok(())
}

#[tokio::test]
async fn first_guide_write_creates_the_table() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let conn = table::open_db(&tmp.path().to_string_lossy()).await?;
    let idx = seeded("hash:d4");
    assert_eq!(idx.persist_guides(&conn, TABLE, &["snes/zelda/guide_1".to_string()]).await?, 3);
    assert_eq!(VectorIndex::load(&conn, TABLE, "hash:d4", 4, 0.25).await?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn guide_write_under_a_new_model_replaces_stale_rows() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let conn = table::open_db(&tmp.path().to_string_lossy()).await?;
    seeded("hash:d4").persist(&conn, TABLE).await?;

    let fresh = VectorIndex::new(4, "bge-m3:d4", 0.25);
    fresh.add(entry("zelda", "snes/zelda/guide_1", 0, vec![0.5, 0.5, 0.0, 0.0]))?;
    fresh.persist_guides(&conn, TABLE, &["snes/zelda/guide_1".to_string()]).await?;

    let loaded = VectorIndex::load(&conn, TABLE, "bge-m3:d4", 4, 0.25).await?;
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded.game_len("earthbound"), 0);
    Ok(())
}
