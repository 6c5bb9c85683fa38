//! Per-user naming and thumbnail preferences.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use media_types::sniff::{SNIFF_LEN, sniff};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::database::models::RenamePatternDbModel;
use crate::database::repositories::PreferenceRepository;
use crate::domain::{ThumbnailRef, UserId, UserProfile};
use crate::naming::{PRESETS, PatternPreset, find_preset, validate_pattern};
use crate::thumbnail::FrameExtractor;
use crate::utils::fs::{ensure_dir_all, io_error, remove_file_quiet};
use crate::{Error, Result};

/// Longest accepted saved-pattern name.
const MAX_PATTERN_NAME_LEN: usize = 64;

/// Hours a one-shot thumbnail waits for the next job.
pub const NEXT_THUMBNAIL_TTL_HOURS: i64 = 24;

/// The pattern a user's jobs are named with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivePattern {
    /// Saved pattern it came from; `None` for an ad-hoc template.
    pub name: Option<String>,
    pub template: String,
}

/// Read side used by the pipeline.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn active_pattern(&self, user_id: UserId) -> Result<Option<ActivePattern>>;
    async fn permanent_thumbnail(&self, user_id: UserId) -> Result<Option<ThumbnailRef>>;
    async fn profile(&self, user_id: UserId) -> Result<UserProfile>;

    /// Remove and return the user's one-shot thumbnail, if one is set and
    /// still fresh. The caller owns the returned file.
    async fn take_next_thumbnail(&self, _user_id: UserId) -> Result<Option<ThumbnailRef>> {
        Ok(None)
    }

    /// Note that a job was named with the saved pattern `name`.
    async fn record_pattern_usage(&self, _user_id: UserId, _name: &str) -> Result<()> {
        Ok(())
    }
}

/// Preference management backed by the database. Thumbnails are stored as
/// JPEGs under `thumbnail_root`.
pub struct PreferenceService {
    repo: Arc<dyn PreferenceRepository>,
    thumbnail_root: PathBuf,
    /// Converts uploaded images to JPEG. Without it only JPEGs are accepted.
    normalizer: Option<FrameExtractor>,
    next_thumbnail_ttl: ChronoDuration,
}

impl PreferenceService {
    pub fn new(repo: Arc<dyn PreferenceRepository>, thumbnail_root: impl Into<PathBuf>) -> Self {
        Self {
            repo,
            thumbnail_root: thumbnail_root.into(),
            normalizer: None,
            next_thumbnail_ttl: ChronoDuration::hours(NEXT_THUMBNAIL_TTL_HOURS),
        }
    }

    pub fn with_normalizer(mut self, normalizer: FrameExtractor) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn with_next_thumbnail_ttl(mut self, ttl: ChronoDuration) -> Self {
        self.next_thumbnail_ttl = ttl;
        self
    }

    pub async fn upsert_profile(
        &self,
        user_id: UserId,
        username: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<()> {
        self.repo
            .upsert_profile(user_id, username, display_name)
            .await
    }

    /// Save (or overwrite) a named pattern.
    pub async fn save_pattern(&self, user_id: UserId, name: &str, template: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() || name.len() > MAX_PATTERN_NAME_LEN {
            return Err(Error::validation(format!(
                "pattern name must be 1 to {MAX_PATTERN_NAME_LEN} bytes"
            )));
        }
        validate_pattern(template)?;

        self.repo
            .save_pattern(&RenamePatternDbModel::new(user_id, name, template))
            .await?;
        debug!(user_id, name, "Saved rename pattern");
        Ok(())
    }

    pub async fn list_patterns(&self, user_id: UserId) -> Result<Vec<RenamePatternDbModel>> {
        self.repo.list_patterns(user_id).await
    }

    pub async fn delete_pattern(&self, user_id: UserId, name: &str) -> Result<()> {
        if !self.repo.delete_pattern(user_id, name.trim()).await? {
            return Err(Error::not_found("RenamePattern", name));
        }
        Ok(())
    }

    /// Make a saved pattern the active one, or clear it with `None`.
    /// Returns the template that is now active.
    pub async fn set_active_pattern(
        &self,
        user_id: UserId,
        name: Option<&str>,
    ) -> Result<Option<String>> {
        let Some(name) = name else {
            self.repo.set_active_pattern(user_id, None, None).await?;
            debug!(user_id, "Cleared active pattern");
            return Ok(None);
        };
        let pattern = self
            .repo
            .get_pattern(user_id, name.trim())
            .await?
            .ok_or_else(|| Error::not_found("RenamePattern", name))?;
        self.repo
            .set_active_pattern(user_id, Some(&pattern.name), Some(&pattern.template))
            .await?;
        Ok(Some(pattern.template))
    }

    /// Set an ad-hoc active pattern without saving it under a name.
    pub async fn set_pattern_template(&self, user_id: UserId, template: &str) -> Result<()> {
        validate_pattern(template)?;
        self.repo
            .set_active_pattern(user_id, None, Some(template))
            .await
    }

    /// Built-in patterns.
    pub fn presets(&self) -> &'static [PatternPreset] {
        PRESETS
    }

    /// Save the preset `name` under its own name and make it active. Usage
    /// is then counted like any saved pattern.
    pub async fn apply_preset(&self, user_id: UserId, name: &str) -> Result<String> {
        let preset = find_preset(name).ok_or_else(|| Error::not_found("PatternPreset", name))?;
        if self.repo.get_pattern(user_id, preset.name).await?.is_none() {
            self.save_pattern(user_id, preset.name, preset.template)
                .await?;
        }
        self.repo
            .set_active_pattern(user_id, Some(preset.name), Some(preset.template))
            .await?;
        info!(user_id, preset = preset.name, "Applied pattern preset");
        Ok(preset.template.to_string())
    }

    fn thumbnail_path(&self, user_id: UserId) -> PathBuf {
        self.thumbnail_root.join(format!("{user_id}.jpg"))
    }

    /// Store `source` as a JPEG at `target`.
    ///
    /// With a normalizer the image is converted and scaled to the thumbnail
    /// size. Without one the source must already be a JPEG and is copied.
    async fn store_jpeg(&self, source: &Path, target: &Path) -> Result<()> {
        ensure_dir_all(&self.thumbnail_root).await?;
        match &self.normalizer {
            Some(normalizer) => {
                let tmp = target.with_extension("tmp.jpg");
                if let Err(e) = normalizer
                    .normalize(source, &tmp, &CancellationToken::new())
                    .await
                {
                    remove_file_quiet(&tmp).await;
                    return Err(Error::validation(format!(
                        "thumbnail could not be converted: {e}"
                    )));
                }
                tokio::fs::rename(&tmp, target)
                    .await
                    .map_err(|e| io_error("storing thumbnail", target, e))?;
            }
            None => {
                if !is_jpeg(source).await? {
                    return Err(Error::validation("thumbnail must be a JPEG image"));
                }
                tokio::fs::copy(source, target)
                    .await
                    .map_err(|e| io_error("copying thumbnail", source, e))?;
            }
        }
        Ok(())
    }

    /// Convert `source` into the thumbnail store and remember it for the user.
    pub async fn set_permanent_thumbnail(
        &self,
        user_id: UserId,
        source: &Path,
    ) -> Result<ThumbnailRef> {
        let target = self.thumbnail_path(user_id);
        self.store_jpeg(source, &target).await?;

        let stored = target.to_string_lossy().to_string();
        self.repo
            .set_permanent_thumbnail(user_id, Some(&stored))
            .await?;
        info!(user_id, path = %stored, "Stored permanent thumbnail");
        Ok(ThumbnailRef::permanent(target))
    }

    pub async fn clear_permanent_thumbnail(&self, user_id: UserId) -> Result<()> {
        if let Some(prefs) = self.repo.get_preferences(user_id).await?
            && let Some(path) = prefs.permanent_thumbnail
        {
            remove_file_quiet(Path::new(&path)).await;
        }
        self.repo.set_permanent_thumbnail(user_id, None).await
    }

    /// Attach `source` to the user's next job only. It expires after
    /// [`NEXT_THUMBNAIL_TTL_HOURS`] if no job picks it up.
    pub async fn set_next_thumbnail(&self, user_id: UserId, source: &Path) -> Result<ThumbnailRef> {
        let target = self.thumbnail_root.join(format!(
            "{user_id}.next.{}.jpg",
            uuid::Uuid::new_v4().simple()
        ));
        self.store_jpeg(source, &target).await?;

        let stored = target.to_string_lossy().to_string();
        let replaced = self
            .repo
            .set_next_thumbnail(user_id, Some(&stored), &Utc::now().to_rfc3339())
            .await?;
        if let Some(old) = replaced {
            remove_file_quiet(Path::new(&old)).await;
        }
        info!(user_id, path = %stored, "Stored next-upload thumbnail");
        Ok(ThumbnailRef::ephemeral(target))
    }

    pub async fn clear_next_thumbnail(&self, user_id: UserId) -> Result<()> {
        let replaced = self
            .repo
            .set_next_thumbnail(user_id, None, &Utc::now().to_rfc3339())
            .await?;
        if let Some(old) = replaced {
            remove_file_quiet(Path::new(&old)).await;
        }
        Ok(())
    }
}

async fn is_jpeg(path: &Path) -> Result<bool> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| io_error("opening thumbnail", path, e))?;
    let mut header = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64)
        .read_to_end(&mut header)
        .await
        .map_err(|e| io_error("reading thumbnail", path, e))?;
    Ok(sniff(&header).is_some_and(|f| f.mime == "image/jpeg"))
}

#[async_trait]
impl PreferenceStore for PreferenceService {
    async fn active_pattern(&self, user_id: UserId) -> Result<Option<ActivePattern>> {
        Ok(self.repo.get_preferences(user_id).await?.and_then(|p| {
            let template = p.active_pattern.filter(|t| !t.trim().is_empty())?;
            Some(ActivePattern {
                name: p.active_pattern_name,
                template,
            })
        }))
    }

    async fn permanent_thumbnail(&self, user_id: UserId) -> Result<Option<ThumbnailRef>> {
        Ok(self
            .repo
            .get_preferences(user_id)
            .await?
            .and_then(|p| p.permanent_thumbnail)
            .map(ThumbnailRef::permanent))
    }

    async fn take_next_thumbnail(&self, user_id: UserId) -> Result<Option<ThumbnailRef>> {
        let Some((path, set_at)) = self.repo.take_next_thumbnail(user_id).await? else {
            return Ok(None);
        };
        let fresh = DateTime::parse_from_rfc3339(&set_at)
            .map(|t| Utc::now() - t.with_timezone(&Utc) <= self.next_thumbnail_ttl)
            .unwrap_or(false);
        if !fresh {
            remove_file_quiet(Path::new(&path)).await;
            debug!(user_id, path = %path, "Next-upload thumbnail expired");
            return Ok(None);
        }
        Ok(Some(ThumbnailRef::ephemeral(path)))
    }

    async fn record_pattern_usage(&self, user_id: UserId, name: &str) -> Result<()> {
        if !self.repo.record_pattern_usage(user_id, name).await? {
            warn!(user_id, name, "Active pattern is no longer saved");
        }
        Ok(())
    }

    async fn profile(&self, user_id: UserId) -> Result<UserProfile> {
        Ok(match self.repo.get_preferences(user_id).await? {
            Some(prefs) => UserProfile {
                user_id,
                username: prefs.username,
                display_name: prefs.display_name,
            },
            None => UserProfile::anonymous(user_id),
        })
    }
}
