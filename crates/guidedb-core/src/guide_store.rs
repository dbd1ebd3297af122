//! Guide store backed by a directory tree: `<root>/<platform>/<game>/guide_<id>.{md,txt}`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::traits::GuideStore;
use crate::types::{normalize_game_id, GameRef, GuideDocument, GuideId};

#[derive(Debug, Clone)]
pub struct FileSystemGuideStore {
    root: PathBuf,
}

impl FileSystemGuideStore {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

    pub fn root(&self) -> &Path { &self.root }

    fn list_guide_files(&self) -> Result<Vec<(PathBuf, GuideId)>> {
        if !self.root.is_dir() {
            return Err(Error::Storage(format!("guides directory {} does not exist", self.root.display())));
        }
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root)
            .min_depth(3)
            .max_depth(3)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            if let Some(id) = self.guide_id_for(path) {
                files.push((path.to_path_buf(), id));
            }
        }
        Ok(files)
    }

    fn guide_id_for(&self, path: &Path) -> Option<GuideId> {
        let ext = path.extension().and_then(|s| s.to_str())?;
        if ext != "md" && ext != "txt" {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        if !stem.starts_with("guide_") {
            return None;
        }
        let rel = path.parent()?.strip_prefix(&self.root).ok()?;
        let mut parts = rel.iter().filter_map(|p| p.to_str());
        let platform = parts.next()?;
        let game = parts.next()?;
        Some(format!("{platform}/{}/{stem}", normalize_game_id(game)))
    }

    fn path_for(&self, guide_id: &str) -> Result<PathBuf> {
        self.list_guide_files()?
            .into_iter()
            .find(|(_, id)| id == guide_id)
            .map(|(p, _)| p)
            .ok_or_else(|| Error::NotFound(format!("guide {guide_id}")))
    }
}

fn split_id(guide_id: &str) -> Option<(&str, &str)> {
    let mut parts = guide_id.splitn(3, '/');
    let platform = parts.next()?;
    let game = parts.next()?;
    parts.next()?;
    Some((platform, game))
}

impl GuideStore for FileSystemGuideStore {
    fn guide(&self, guide_id: &str) -> Result<GuideDocument> {
        let (platform, game) = split_id(guide_id).ok_or_else(|| Error::NotFound(format!("malformed guide id {guide_id}")))?;
        let path = self.path_for(guide_id)?;
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read guide");
                return Err(Error::Storage(format!("read {}: {e}", path.display())));
            }
        };
        Ok(GuideDocument {
            guide_id: guide_id.to_string(),
            game_id: game.to_string(),
            platform: platform.to_string(),
            text,
            source: path.display().to_string(),
        })
    }

    fn guides_for_game(&self, game_id: &str) -> Result<Vec<GuideId>> {
        let game_id = normalize_game_id(game_id);
        let guides: Vec<GuideId> = self
            .list_guide_files()?
            .into_iter()
            .map(|(_, id)| id)
            .filter(|id| split_id(id).is_some_and(|(_, g)| g == game_id))
            .collect();
        debug!(game_id, guides = guides.len(), "listed guides");
        Ok(guides)
    }

    fn games(&self) -> Result<Vec<GameRef>> {
        let mut games: Vec<GameRef> = self
            .list_guide_files()?
            .into_iter()
            .filter_map(|(_, id)| {
                split_id(&id).map(|(platform, game)| GameRef { game_id: game.to_string(), platform: platform.to_string() })
            })
            .collect();
        games.sort();
        games.dedup();
        Ok(games)
    }
}
