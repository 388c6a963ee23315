use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{PipelineError, RemoteServiceError};
use crate::schema::{
    GenerationConfig, GenerationJob, GenerationMode, IMAGE_FAILED, Stage, VIDEO_FAILED,
    VIDEO_TIMED_OUT,
};
use crate::services::{
    CredentialPrompt, GenerationService, HistoryStore, MediaVault, decode_data_uri,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    Expanding,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum View {
    #[default]
    Current,
    History,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            Self::Image => "png",
            Self::Video => "mp4",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaFile {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// What the presentation layer renders.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Workspace {
    pub phase: RunPhase,
    pub focus: View,
    pub current: Vec<GenerationJob>,
    pub history: Vec<GenerationJob>,
    /// Ids the user deleted; late task results for them are dropped.
    #[serde(skip)]
    deleted: HashSet<String>,
}

impl Workspace {
    /// Current run first, then history.
    pub fn find(&self, id: &str) -> Option<&GenerationJob> {
        self.current
            .iter()
            .chain(self.history.iter())
            .find(|job| job.id == id)
    }

    /// Live update of every view that already holds the job.
    fn replace(&mut self, job: &GenerationJob) {
        for slot in self
            .current
            .iter_mut()
            .chain(self.history.iter_mut())
            .filter(|slot| slot.id == job.id)
        {
            *slot = job.clone();
        }
    }

    fn is_deleted(&self, id: &str) -> bool {
        self.deleted.contains(id)
    }

    /// Live update plus history upsert; new entries go to the front.
    /// Returns false for a deleted job, which is left out of every view.
    fn publish(&mut self, job: &GenerationJob) -> bool {
        if self.is_deleted(&job.id) {
            return false;
        }
        if let Some(slot) = self.current.iter_mut().find(|slot| slot.id == job.id) {
            *slot = job.clone();
        }
        match self.history.iter_mut().find(|slot| slot.id == job.id) {
            Some(slot) => *slot = job.clone(),
            None => self.history.insert(0, job.clone()),
        }
        true
    }

    fn remove(&mut self, id: &str) -> Vec<GenerationJob> {
        self.deleted.insert(id.to_string());
        let mut removed = Vec::new();
        for view in [&mut self.current, &mut self.history] {
            let (gone, kept): (Vec<_>, Vec<_>) =
                std::mem::take(view).into_iter().partition(|job| job.id == id);
            *view = kept;
            removed.extend(gone);
        }
        removed
    }

    /// Drop every history entry; ids that are not on the current run count as deleted.
    fn clear_history(&mut self) -> Vec<GenerationJob> {
        let cleared = std::mem::take(&mut self.history);
        for job in &cleared {
            if !self.current.iter().any(|live| live.id == job.id) {
                self.deleted.insert(job.id.clone());
            }
        }
        cleared
    }

    /// Video handles of `dropped` jobs that no view references any more.
    fn orphaned_videos(&self, dropped: &[GenerationJob]) -> Vec<String> {
        dropped
            .iter()
            .filter(|job| self.find(&job.id).is_none())
            .filter_map(|job| job.video_url.clone())
            .collect()
    }

    pub fn visible(&self) -> &[GenerationJob] {
        match self.focus {
            View::Current => &self.current,
            View::History => &self.history,
        }
    }
}

struct Shared {
    generator: Arc<dyn GenerationService>,
    store: Arc<dyn HistoryStore>,
    credentials: Arc<dyn CredentialPrompt>,
    vault: Arc<MediaVault>,
    workspace: Mutex<Workspace>,
}

/// Fans a base prompt out into per-scene jobs and drives each one on its own task.
///
/// Each task owns its copy of the job and publishes it by id after every
/// stage transition, so siblings never contend over positions in a view.
pub struct Pipeline {
    shared: Arc<Shared>,
    tasks: Mutex<JoinSet<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Collect tasks that already finished so the set only holds running jobs.
fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            tracing::error!(error = %e, "pipeline: job task panicked");
        }
    }
}

fn failure_message(stage: Stage, err: &RemoteServiceError) -> &'static str {
    match stage {
        Stage::Image => IMAGE_FAILED,
        Stage::Video if err.is_timeout() => VIDEO_TIMED_OUT,
        Stage::Video => VIDEO_FAILED,
    }
}

impl Shared {
    fn show(&self, job: &GenerationJob) {
        lock(&self.workspace).replace(job);
    }

    fn release_videos(&self, handles: Vec<String>) {
        for handle in handles {
            self.vault.remove(&handle);
        }
    }

    /// Store failures are logged; the live views advance regardless.
    /// Results for a deleted job are discarded along with their video.
    async fn persist(&self, job: &GenerationJob) {
        if !lock(&self.workspace).is_deleted(&job.id) {
            if let Err(e) = self.store.save(job).await {
                tracing::warn!(job_id = %job.id, error = %e, "pipeline: failed to persist job");
            }
            if lock(&self.workspace).publish(job) {
                return;
            }
            // deleted while the save was in flight
            if let Err(e) = self.store.delete(&job.id).await {
                tracing::warn!(job_id = %job.id, error = %e, "pipeline: failed to delete history record");
            }
        }
        tracing::debug!(job_id = %job.id, "pipeline: dropping result for deleted job");
        if let Some(handle) = &job.video_url {
            self.vault.remove(handle);
        }
    }

    async fn fail_stage(&self, job: &mut GenerationJob, stage: Stage, err: RemoteServiceError) {
        tracing::warn!(
            job_id = %job.id,
            stage = stage.as_str(),
            error = %err,
            "pipeline: stage failed"
        );
        job.fail(stage, failure_message(stage, &err));
        self.persist(job).await;
        if err.needs_credential() {
            let reason = if err.is_entity_not_found() {
                "the selected API credential cannot reach the model"
            } else {
                "no API credential configured"
            };
            self.credentials.request_credential(reason).await;
        }
    }

    async fn drive(self: Arc<Self>, mut job: GenerationJob, config: Arc<GenerationConfig>) {
        if config.mode.needs_image() {
            match self.generator.generate_image(job.scene_prompt(), &config).await {
                Ok(image_url) => {
                    job.complete_image(image_url);
                    tracing::info!(job_id = %job.id, "pipeline: image ready");
                    self.persist(&job).await;
                }
                Err(err) => {
                    self.fail_stage(&mut job, Stage::Image, err).await;
                    return;
                }
            }
            if config.mode != GenerationMode::ImageThenVideo {
                return;
            }
            job.begin_video();
            self.show(&job);
        }
        self.run_video(job, &config).await;
    }

    async fn run_video(&self, mut job: GenerationJob, config: &GenerationConfig) {
        let source = job.image_url.clone();
        match self
            .generator
            .generate_video(job.scene_prompt(), config, source.as_deref())
            .await
        {
            Ok(video) => {
                let handle = self.vault.insert(video.mime_type, video.bytes);
                job.complete_video(handle);
                tracing::info!(job_id = %job.id, "pipeline: video ready");
                self.persist(&job).await;
            }
            Err(err) => self.fail_stage(&mut job, Stage::Video, err).await,
        }
    }

    fn media(&self, job: &GenerationJob, kind: MediaKind) -> Option<(String, Vec<u8>)> {
        match kind {
            MediaKind::Image => job.image_url.as_deref().and_then(decode_data_uri),
            MediaKind::Video => {
                let blob = self.vault.get(job.video_url.as_deref()?)?;
                Some((blob.mime_type.clone(), blob.bytes.clone()))
            }
        }
    }
}

impl Pipeline {
    pub fn new(
        generator: Arc<dyn GenerationService>,
        store: Arc<dyn HistoryStore>,
        credentials: Arc<dyn CredentialPrompt>,
        vault: Arc<MediaVault>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                generator,
                store,
                credentials,
                vault,
                workspace: Mutex::new(Workspace::default()),
            }),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn snapshot(&self) -> Workspace {
        lock(&self.shared.workspace).clone()
    }

    pub fn set_focus(&self, view: View) {
        lock(&self.shared.workspace).focus = view;
    }

    /// Fill the history view from the store, failing stages a previous process left running.
    pub async fn load_history(&self) -> Result<usize, PipelineError> {
        let mut jobs = self.shared.store.get_all().await?;
        for job in jobs.iter_mut().filter(|job| job.is_busy()) {
            job.recover_interrupted();
            tracing::warn!(job_id = %job.id, "pipeline: recovered interrupted job");
            if let Err(e) = self.shared.store.save(job).await {
                tracing::warn!(job_id = %job.id, error = %e, "pipeline: failed to persist recovered job");
            }
        }
        let count = jobs.len();
        lock(&self.shared.workspace).history = jobs;
        tracing::info!(count, "pipeline: history loaded");
        Ok(count)
    }

    /// Expand `base_prompt` and start one task per returned scene.
    ///
    /// A blank prompt is a no-op. An expansion failure leaves no jobs behind.
    pub async fn start_run(
        &self,
        base_prompt: &str,
        config: GenerationConfig,
    ) -> Result<Vec<GenerationJob>, PipelineError> {
        let base_prompt = base_prompt.trim();
        if base_prompt.is_empty() {
            return Ok(Vec::new());
        }
        config.validate()?;

        {
            let mut workspace = lock(&self.shared.workspace);
            workspace.phase = RunPhase::Expanding;
            let replaced = std::mem::take(&mut workspace.current);
            let orphaned = workspace.orphaned_videos(&replaced);
            workspace.focus = View::Current;
            drop(workspace);
            self.shared.release_videos(orphaned);
        }
        tracing::info!(
            scene_count = config.scene_count,
            mode = config.mode.as_str(),
            style = config.style.as_str(),
            "pipeline: expanding prompt"
        );

        let scenes = match self
            .shared
            .generator
            .expand_prompt(base_prompt, config.style, config.scene_count)
            .await
        {
            Ok(scenes) => scenes,
            Err(err) => {
                lock(&self.shared.workspace).phase = RunPhase::Idle;
                tracing::error!(error = %err, "pipeline: prompt expansion failed");
                return Err(PipelineError::Expansion(err));
            }
        };
        if scenes.len() != usize::from(config.scene_count) {
            tracing::warn!(
                requested = config.scene_count,
                received = scenes.len(),
                "pipeline: expansion returned a different scene count"
            );
        }

        let created_at = chrono::Utc::now();
        let used_reference = config.has_reference();
        let jobs: Vec<GenerationJob> = scenes
            .into_iter()
            .enumerate()
            .map(|(index, scene)| {
                GenerationJob::new(
                    GenerationJob::make_id(created_at, index),
                    scene,
                    config.mode,
                    used_reference,
                )
            })
            .collect();

        {
            let mut workspace = lock(&self.shared.workspace);
            workspace.current = jobs.clone();
            workspace.phase = RunPhase::Idle;
        }

        let trace_id = Uuid::new_v4();
        let config = Arc::new(config);
        let mut tasks = lock(&self.tasks);
        reap_finished(&mut tasks);
        for job in &jobs {
            let span = tracing::info_span!("job", job_id = %job.id, %trace_id);
            let shared = Arc::clone(&self.shared);
            tasks.spawn(shared.drive(job.clone(), Arc::clone(&config)).instrument(span));
        }
        tracing::info!(jobs = jobs.len(), %trace_id, "pipeline: run started");
        Ok(jobs)
    }

    /// Start a fresh video attempt for a job from either view.
    pub async fn animate_existing(
        &self,
        id: &str,
        config: GenerationConfig,
    ) -> Result<GenerationJob, PipelineError> {
        config.validate()?;
        let mut job = lock(&self.shared.workspace)
            .find(id)
            .cloned()
            .ok_or_else(|| PipelineError::JobNotFound(id.to_string()))?;

        if job.image_state.is_active() {
            return Err(PipelineError::ImageInProgress(id.to_string()));
        }
        let previous = job.video_url.clone();
        if !job.begin_video() {
            return Err(PipelineError::VideoInProgress(id.to_string()));
        }
        if let Some(handle) = previous {
            self.shared.vault.remove(&handle);
        }
        self.shared.persist(&job).await;

        let span = tracing::info_span!("animate", job_id = %job.id);
        let shared = Arc::clone(&self.shared);
        let attempt = job.clone();
        let mut tasks = lock(&self.tasks);
        reap_finished(&mut tasks);
        tasks.spawn(async move { shared.run_video(attempt, &config).await }.instrument(span));
        drop(tasks);
        tracing::info!(job_id = %job.id, "pipeline: animation started");
        Ok(job)
    }

    pub async fn delete_history_item(&self, id: &str) {
        if let Err(e) = self.shared.store.delete(id).await {
            tracing::warn!(job_id = %id, error = %e, "pipeline: failed to delete history record");
        }
        let orphaned = {
            let mut workspace = lock(&self.shared.workspace);
            let removed = workspace.remove(id);
            workspace.orphaned_videos(&removed)
        };
        self.shared.release_videos(orphaned);
    }

    /// Empties history; the current run stays on screen.
    pub async fn clear_history(&self) {
        if let Err(e) = self.shared.store.clear().await {
            tracing::warn!(error = %e, "pipeline: failed to clear history store");
        }
        let orphaned = {
            let mut workspace = lock(&self.shared.workspace);
            let cleared = workspace.clear_history();
            workspace.orphaned_videos(&cleared)
        };
        self.shared.release_videos(orphaned);
        tracing::info!("pipeline: history cleared");
    }

    pub fn download(&self, id: &str, kind: MediaKind) -> Result<MediaFile, PipelineError> {
        let job = lock(&self.shared.workspace)
            .find(id)
            .cloned()
            .ok_or_else(|| PipelineError::JobNotFound(id.to_string()))?;
        let (mime_type, bytes) =
            self.shared
                .media(&job, kind)
                .ok_or_else(|| PipelineError::MediaUnavailable {
                    id: id.to_string(),
                    kind: kind.as_str(),
                })?;
        Ok(MediaFile {
            file_name: format!("dreamscene-{}.{}", job.id, kind.extension()),
            mime_type,
            bytes,
        })
    }

    /// Write every image and video of the focused view into `dir`.
    pub async fn export_visible(&self, dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
        let visible = lock(&self.shared.workspace).visible().to_vec();
        let files: Vec<MediaFile> = visible
            .iter()
            .enumerate()
            .flat_map(|(index, job)| {
                [MediaKind::Image, MediaKind::Video]
                    .into_iter()
                    .filter_map(move |kind| {
                        let (mime_type, bytes) = self.shared.media(job, kind)?;
                        Some(MediaFile {
                            file_name: format!(
                                "scene-{index}-{}.{}",
                                kind.as_str(),
                                kind.extension()
                            ),
                            mime_type,
                            bytes,
                        })
                    })
            })
            .collect();

        tokio::fs::create_dir_all(dir).await?;
        let mut written = Vec::with_capacity(files.len());
        for file in files {
            let path = dir.join(&file.file_name);
            tokio::fs::write(&path, &file.bytes).await?;
            written.push(path);
        }
        tracing::info!(files = written.len(), dir = %dir.display(), "pipeline: export finished");
        Ok(written)
    }

    /// Wait for every spawned job task, including ones spawned while waiting.
    pub async fn wait_idle(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *lock(&self.tasks));
            if tasks.is_empty() {
                return;
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    tracing::error!(error = %e, "pipeline: job task panicked");
                }
            }
        }
    }
}
