// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use super::Store;
use super::catalog::Catalog;
use crate::error::StoreError;
use crate::model::{Episode, EpisodeUpsert, Podcast, PodcastFields};

const PODCAST_FILENAME: &str = "podcast.json";
const EPISODES_DIRNAME: &str = "episodes";
const PARTIAL_SUFFIX: &str = ".partial";

/// File-backed store: one directory per podcast holding `podcast.json` and
/// one JSON file per episode under `episodes/`.
///
/// Each upsert rewrites exactly one file through a `.partial` sibling and a
/// rename, so a crash leaves at worst a stray partial file that the next
/// [`JsonStore::open`] removes.
pub struct JsonStore {
    root: PathBuf,
    catalog: RwLock<Catalog>,
}

impl JsonStore {
    /// Open (or create) a store rooted at `root`, indexing everything on disk
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let (catalog, partial_files_cleaned) = scan_root(root)?;

        if partial_files_cleaned > 0 {
            tracing::info!(
                root = %root.display(),
                count = partial_files_cleaned,
                "Removed partial files left by an interrupted write"
            );
        }

        Ok(Self {
            root: root.to_path_buf(),
            catalog: RwLock::new(catalog),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn podcast_dir(&self, podcast_id: &str) -> PathBuf {
        self.root.join(path_segment(podcast_id))
    }

    fn podcast_path(&self, podcast_id: &str) -> PathBuf {
        self.podcast_dir(podcast_id).join(PODCAST_FILENAME)
    }

    fn episode_path(&self, podcast_id: &str, episode_id: &str) -> PathBuf {
        self.podcast_dir(podcast_id)
            .join(EPISODES_DIRNAME)
            .join(format!("{}.json", path_segment(episode_id)))
    }

    /// Remove the file of an episode that moved to another podcast
    async fn remove_moved(&self, previous: Option<&Episode>, podcast_id: &str) {
        let Some(previous) = previous.filter(|p| p.podcast_id != podcast_id) else {
            return;
        };

        let stale_path = self.episode_path(&previous.podcast_id, &previous.external_id);
        if let Err(e) = tokio::fs::remove_file(&stale_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(
                path = %stale_path.display(),
                error = %e,
                "Failed to remove episode file after it changed podcast"
            );
        }
    }
}

#[async_trait]
impl Store for JsonStore {
    async fn get_podcast(&self, external_id: &str) -> Result<Option<Podcast>, StoreError> {
        Ok(self.catalog.read().await.podcast(external_id).cloned())
    }

    async fn list_podcasts(&self) -> Result<Vec<Podcast>, StoreError> {
        Ok(self.catalog.read().await.podcasts())
    }

    async fn upsert_podcast(
        &self,
        external_id: &str,
        fields: PodcastFields,
    ) -> Result<Podcast, StoreError> {
        let mut catalog = self.catalog.write().await;
        let podcast = catalog.merged_podcast(external_id, fields);

        write_json(&self.podcast_path(external_id), &podcast).await?;
        catalog.put_podcast(podcast.clone());
        Ok(podcast)
    }

    async fn episodes_of(&self, podcast_id: &str) -> Result<Vec<Episode>, StoreError> {
        Ok(self.catalog.read().await.episodes_of(podcast_id))
    }

    async fn upsert_episode(
        &self,
        podcast_id: &str,
        upsert: EpisodeUpsert,
    ) -> Result<Episode, StoreError> {
        let mut catalog = self.catalog.write().await;
        let (episode, previous) = catalog.merged_episode(podcast_id, upsert)?;

        write_json(
            &self.episode_path(podcast_id, &episode.external_id),
            &episode,
        )
        .await?;
        self.remove_moved(previous.as_ref(), podcast_id).await;

        catalog.put_episode(episode.clone());
        Ok(episode)
    }

    async fn mark_description_verified(
        &self,
        external_id: &str,
        description: Option<String>,
    ) -> Result<Episode, StoreError> {
        let mut catalog = self.catalog.write().await;
        let episode = catalog.verified_episode(external_id, description)?;

        write_json(
            &self.episode_path(&episode.podcast_id, &episode.external_id),
            &episode,
        )
        .await?;

        catalog.put_episode(episode.clone());
        Ok(episode)
    }

    async fn get_episode_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Episode>, StoreError> {
        Ok(self.catalog.read().await.episode(external_id).cloned())
    }

    async fn touch_last_checked(
        &self,
        podcast_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Podcast, StoreError> {
        let mut catalog = self.catalog.write().await;
        let mut podcast = catalog
            .podcast(podcast_id)
            .cloned()
            .ok_or_else(|| StoreError::PodcastNotFound(podcast_id.to_string()))?;
        podcast.last_checked_at = Some(at);

        write_json(&self.podcast_path(podcast_id), &podcast).await?;
        catalog.put_podcast(podcast.clone());
        Ok(podcast)
    }

    async fn delete_podcast(&self, podcast_id: &str) -> Result<bool, StoreError> {
        let mut catalog = self.catalog.write().await;
        if catalog.podcast(podcast_id).is_none() {
            return Ok(false);
        }

        let dir = self.podcast_dir(podcast_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StoreError::WriteFailed {
                    path: dir,
                    source: e,
                });
            }
        }

        Ok(catalog.remove_podcast(podcast_id).is_some())
    }
}

/// Map an external id to a safe single path segment.
///
/// Ascii alphanumerics, `-` and `_` pass through; every other byte is written
/// as `%XX` so distinct ids never share a file.
fn path_segment(id: &str) -> String {
    let mut segment = String::with_capacity(id.len());
    for c in id.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
            segment.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                segment.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    if segment.is_empty() {
        segment.push('%');
    }
    segment
}

fn partial_path(path: &Path) -> PathBuf {
    let mut partial = path.as_os_str().to_owned();
    partial.push(PARTIAL_SUFFIX);
    PathBuf::from(partial)
}

/// Serialize `value` and replace `path` with it atomically
async fn write_json<T: Serialize + Sync>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(value)?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::WriteFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
    }

    let partial = partial_path(path);
    tokio::fs::write(&partial, json)
        .await
        .map_err(|e| StoreError::WriteFailed {
            path: partial.clone(),
            source: e,
        })?;

    tokio::fs::rename(&partial, path)
        .await
        .map_err(|e| StoreError::WriteFailed {
            path: path.to_path_buf(),
            source: e,
        })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let content = std::fs::read_to_string(path).map_err(|e| StoreError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    serde_json::from_str(&content).map_err(|e| StoreError::JsonParseFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

fn read_dir(path: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = std::fs::read_dir(path).map_err(|e| StoreError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        paths.push(entry.path());
    }
    Ok(paths)
}

fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(PARTIAL_SUFFIX))
}

/// Delete stray partial files among `paths`, returning how many went away
fn clean_partials(paths: &[PathBuf]) -> usize {
    paths
        .iter()
        .filter(|path| is_partial(path))
        .filter(|path| std::fs::remove_file(path).is_ok())
        .count()
}

/// Build the in-memory index from the directory tree, creating the root if needed.
///
/// Unreadable records are skipped with a warning rather than failing the open.
fn scan_root(root: &Path) -> Result<(Catalog, usize), StoreError> {
    let mut catalog = Catalog::default();
    let mut partial_files_cleaned = 0;

    if !root.exists() {
        std::fs::create_dir_all(root).map_err(|e| StoreError::WriteFailed {
            path: root.to_path_buf(),
            source: e,
        })?;
        return Ok((catalog, partial_files_cleaned));
    }

    for podcast_dir in read_dir(root)?.into_iter().filter(|p| p.is_dir()) {
        let entries = read_dir(&podcast_dir)?;
        partial_files_cleaned += clean_partials(&entries);

        let podcast_path = podcast_dir.join(PODCAST_FILENAME);
        if !podcast_path.is_file() {
            tracing::warn!(dir = %podcast_dir.display(), "Skipping directory without podcast.json");
            continue;
        }

        let podcast: Podcast = match read_json(&podcast_path) {
            Ok(podcast) => podcast,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable podcast record");
                continue;
            }
        };
        let podcast_id = podcast.external_id.clone();
        catalog.put_podcast(podcast);

        let episodes_dir = podcast_dir.join(EPISODES_DIRNAME);
        if !episodes_dir.is_dir() {
            continue;
        }

        let episode_paths = read_dir(&episodes_dir)?;
        partial_files_cleaned += clean_partials(&episode_paths);

        for path in episode_paths
            .iter()
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        {
            match read_json::<Episode>(path) {
                Ok(mut episode) => {
                    episode.podcast_id = podcast_id.clone();
                    catalog.put_episode(episode);
                }
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable episode record"),
            }
        }
    }

    Ok((catalog, partial_files_cleaned))
}
