//! Per-guide indexing state.
//!
//! `NotIndexed -> Indexing -> Indexed`, with `Indexing -> Failed` once a job gives up.
//! A failed guide becomes due again after the cooldown. Guides without an entry are
//! `NotIndexed`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use guidedb_core::types::{GameId, GuideId, IndexStatus};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct GuideState {
    status: IndexStatus,
    game_id: Option<GameId>,
    failed_at: Option<Instant>,
    cancel: CancellationToken,
}

impl GuideState {
    fn new(status: IndexStatus) -> Self { Self { status, game_id: None, failed_at: None, cancel: CancellationToken::new() } }
}

#[derive(Debug, Default)]
pub struct StatusBoard {
    guides: Mutex<HashMap<GuideId, GuideState>>,
}

impl StatusBoard {
    pub fn new() -> Self { Self::default() }

    pub fn get(&self, guide_id: &str) -> IndexStatus {
        self.guides.lock().get(guide_id).map_or(IndexStatus::NotIndexed, |s| s.status)
    }

    /// Whether a retrieval should schedule indexing for this guide.
    pub fn is_due(&self, guide_id: &str, cooldown: Duration) -> bool {
        match self.guides.lock().get(guide_id) {
            None => true,
            Some(s) => match s.status {
                IndexStatus::NotIndexed => true,
                IndexStatus::Failed => s.failed_at.map_or(true, |at| at.elapsed() >= cooldown),
                IndexStatus::Indexing | IndexStatus::Indexed => false,
            },
        }
    }

    /// Move a guide to `Indexing` and hand out the token its job must watch.
    ///
    /// The token is a child of `parent`, so cancelling `parent` stops every job.
    pub fn begin(&self, guide_id: &str, parent: &CancellationToken) -> CancellationToken {
        let mut guides = self.guides.lock();
        let state = guides.entry(guide_id.to_string()).or_insert_with(|| GuideState::new(IndexStatus::NotIndexed));
        state.status = IndexStatus::Indexing;
        state.failed_at = None;
        state.cancel = parent.child_token();
        state.cancel.clone()
    }

    pub fn set_game(&self, guide_id: &str, game_id: &str) {
        if let Some(s) = self.guides.lock().get_mut(guide_id) {
            s.game_id = Some(game_id.to_string());
        }
    }

    /// Record a guide already present in the loaded index.
    pub fn mark_indexed(&self, guide_id: &str, game_id: &str) {
        let mut state = GuideState::new(IndexStatus::Indexed);
        state.game_id = Some(game_id.to_string());
        self.guides.lock().insert(guide_id.to_string(), state);
    }

    /// Settle a running job as `Indexed`. Returns false when the job was cancelled or
    /// the guide was reset meanwhile.
    pub fn finish(&self, guide_id: &str) -> bool {
        match self.guides.lock().get_mut(guide_id) {
            Some(s) if s.status == IndexStatus::Indexing && !s.cancel.is_cancelled() => {
                s.status = IndexStatus::Indexed;
                true
            }
            _ => false,
        }
    }

    pub fn fail(&self, guide_id: &str) {
        if let Some(s) = self.guides.lock().get_mut(guide_id) {
            s.status = IndexStatus::Failed;
            s.failed_at = Some(Instant::now());
        }
    }

    /// Cancel the guide's running job, if any. Returns the guide's game when known.
    pub fn cancel(&self, guide_id: &str) -> Option<GameId> {
        let guides = self.guides.lock();
        let state = guides.get(guide_id)?;
        state.cancel.cancel();
        state.game_id.clone()
    }

    /// Forget the guide; it reads as `NotIndexed` from now on.
    pub fn reset(&self, guide_id: &str) { self.guides.lock().remove(guide_id); }

    /// A job stopped without finishing: forget the guide unless it already settled.
    pub fn abandon(&self, guide_id: &str) {
        let mut guides = self.guides.lock();
        if guides.get(guide_id).is_some_and(|s| s.status == IndexStatus::Indexing) {
            guides.remove(guide_id);
        }
    }
}

/// Collapse per-guide states into one status for a game.
///
/// Any running job makes the game `Indexing`; otherwise it is `Indexed` only when
/// every guide is, `Failed` when some guide failed, else `NotIndexed`.
pub fn aggregate(statuses: impl IntoIterator<Item = IndexStatus>) -> IndexStatus {
    let (mut any, mut all_indexed, mut failed) = (false, true, false);
    for s in statuses {
        any = true;
        match s {
            IndexStatus::Indexing => return IndexStatus::Indexing,
            IndexStatus::Indexed => {}
            IndexStatus::Failed => {
                failed = true;
                all_indexed = false;
            }
            IndexStatus::NotIndexed => all_indexed = false,
        }
    }
    if any && all_indexed {
        IndexStatus::Indexed
    } else if failed {
        IndexStatus::Failed
    } else {
        IndexStatus::NotIndexed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_guides_are_not_indexed_and_due() {
        let board = StatusBoard::new();
        assert_eq!(board.get("snes/zelda/guide_1"), IndexStatus::NotIndexed);
        assert!(board.is_due("snes/zelda/guide_1", Duration::from_secs(60)));
    }

    #[test]
    fn lifecycle_transitions() {
        let board = StatusBoard::new();
        let root = CancellationToken::new();
        board.begin("g", &root);
        board.set_game("g", "zelda");
        assert_eq!(board.get("g"), IndexStatus::Indexing);
        assert!(!board.is_due("g", Duration::ZERO));

        assert!(board.finish("g"));
        assert_eq!(board.get("g"), IndexStatus::Indexed);
        assert_eq!(board.cancel("g").as_deref(), Some("zelda"));

        board.reset("g");
        assert_eq!(board.get("g"), IndexStatus::NotIndexed);
    }

    #[test]
    fn failed_guides_wait_for_the_cooldown() {
        let board = StatusBoard::new();
        board.begin("g", &CancellationToken::new());
        board.fail("g");
        assert_eq!(board.get("g"), IndexStatus::Failed);
        assert!(!board.is_due("g", Duration::from_secs(3600)));
        assert!(board.is_due("g", Duration::ZERO));
    }

    #[test]
    fn cancel_reaches_the_job_token_and_parent_cancels_all() {
        let board = StatusBoard::new();
        let root = CancellationToken::new();
        let a = board.begin("a", &root);
        let b = board.begin("b", &root);
        board.cancel("a");
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        root.cancel();
        assert!(b.is_cancelled());
    }

    #[test]
    fn begin_hands_out_a_fresh_token() {
        let board = StatusBoard::new();
        let root = CancellationToken::new();
        let first = board.begin("g", &root);
        board.cancel("g");
        let second = board.begin("g", &root);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn abandon_only_forgets_running_guides() {
        let board = StatusBoard::new();
        let root = CancellationToken::new();
        board.begin("running", &root);
        board.begin("done", &root);
        assert!(board.finish("done"));
        board.abandon("running");
        board.abandon("done");
        assert_eq!(board.get("running"), IndexStatus::NotIndexed);
        assert_eq!(board.get("done"), IndexStatus::Indexed);
    }

    #[test]
    fn finish_refuses_cancelled_or_reset_jobs() {
        let board = StatusBoard::new();
        let root = CancellationToken::new();
        board.begin("cancelled", &root);
        board.cancel("cancelled");
        assert!(!board.finish("cancelled"));
        assert_eq!(board.get("cancelled"), IndexStatus::Indexing);

        board.begin("deleted", &root);
        board.reset("deleted");
        assert!(!board.finish("deleted"));
        assert_eq!(board.get("deleted"), IndexStatus::NotIndexed);
    }

    #[test]
    fn aggregate_game_status() {
        use IndexStatus::*;
        assert_eq!(aggregate([]), NotIndexed);
        assert_eq!(aggregate([Indexed, Indexed]), Indexed);
        assert_eq!(aggregate([Indexed, NotIndexed]), NotIndexed);
        assert_eq!(aggregate([Indexed, Failed]), Failed);
        assert_eq!(aggregate([Failed, Indexing]), Indexing);
    }
}
