use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::config::GenerationMode;

pub const IMAGE_FAILED: &str = "Image generation failed";
pub const VIDEO_FAILED: &str = "Video generation failed";
pub const VIDEO_TIMED_OUT: &str = "Video generation timed out";
pub const INTERRUPTED: &str = "Interrupted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    #[default]
    Idle,
    InProgress,
    Done,
    Failed,
}

impl StageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl FromStr for StageState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown stage state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Image,
    Video,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

/// One scene's generation unit.
///
/// `scene_prompt` is fixed at construction. Stage states only move
/// idle -> in_progress -> done/failed; a fresh video attempt is the single
/// way back into in_progress for a finished video stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: String,
    scene_prompt: String,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub image_state: StageState,
    pub video_state: StageState,
    pub error: Option<String>,
    pub used_reference: bool,
}

impl GenerationJob {
    /// `{millis}-{index}`; sorts lexicographically by recency.
    pub fn make_id(created_at: DateTime<Utc>, index: usize) -> String {
        format!("{}-{}", created_at.timestamp_millis(), index)
    }

    pub fn new(id: String, scene_prompt: String, mode: GenerationMode, used_reference: bool) -> Self {
        Self {
            id,
            scene_prompt,
            image_url: None,
            video_url: None,
            image_state: if mode.needs_image() {
                StageState::InProgress
            } else {
                StageState::Idle
            },
            video_state: if mode == GenerationMode::VideoOnly {
                StageState::InProgress
            } else {
                StageState::Idle
            },
            error: None,
            used_reference,
        }
    }

    /// Rebuild a job from a stored record.
    pub fn restore(
        id: String,
        scene_prompt: String,
        image_url: Option<String>,
        image_state: StageState,
        video_state: StageState,
        error: Option<String>,
        used_reference: bool,
    ) -> Self {
        Self {
            id,
            scene_prompt,
            image_url,
            video_url: None,
            image_state,
            video_state,
            error,
            used_reference,
        }
    }

    pub fn scene_prompt(&self) -> &str {
        &self.scene_prompt
    }

    /// Copy safe to write to durable storage: the session-local video handle is dropped.
    pub fn durable(&self) -> Self {
        Self {
            video_url: None,
            ..self.clone()
        }
    }

    pub fn complete_image(&mut self, image_url: String) {
        self.image_url = Some(image_url);
        self.image_state = StageState::Done;
    }

    /// Enter a video attempt. A finished attempt is discarded; a running one refuses.
    pub fn begin_video(&mut self) -> bool {
        if self.video_state.is_active() {
            return false;
        }
        if self.video_state.is_finished() {
            self.video_url = None;
            self.error = None;
        }
        self.video_state = StageState::InProgress;
        true
    }

    pub fn complete_video(&mut self, video_url: String) {
        debug_assert!(!self.image_state.is_active());
        self.video_url = Some(video_url);
        self.video_state = StageState::Done;
    }

    pub fn fail(&mut self, stage: Stage, message: impl Into<String>) {
        match stage {
            Stage::Image => self.image_state = StageState::Failed,
            Stage::Video => self.video_state = StageState::Failed,
        }
        self.error = Some(message.into());
    }

    /// Mark stages left running by a previous process as failed.
    pub fn recover_interrupted(&mut self) -> bool {
        let mut changed = false;
        for stage in [Stage::Image, Stage::Video] {
            let state = match stage {
                Stage::Image => self.image_state,
                Stage::Video => self.video_state,
            };
            if state.is_active() {
                self.fail(stage, INTERRUPTED);
                changed = true;
            }
        }
        changed
    }

    pub fn is_busy(&self) -> bool {
        self.image_state.is_active() || self.video_state.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job(mode: GenerationMode) -> GenerationJob {
        GenerationJob::new("1-0".to_string(), "a scene".to_string(), mode, false)
    }

    #[test]
    fn initial_states_follow_mode() {
        let photo = job(GenerationMode::ImageOnly);
        assert_eq!(photo.image_state, StageState::InProgress);
        assert_eq!(photo.video_state, StageState::Idle);

        let both = job(GenerationMode::ImageThenVideo);
        assert_eq!(both.image_state, StageState::InProgress);
        assert_eq!(both.video_state, StageState::Idle);

        let video = job(GenerationMode::VideoOnly);
        assert_eq!(video.image_state, StageState::Idle);
        assert_eq!(video.video_state, StageState::InProgress);
    }

    #[test]
    fn ids_sort_by_creation_time() {
        let earlier = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let later = Utc.timestamp_millis_opt(1_700_000_000_500).unwrap();
        let a = GenerationJob::make_id(earlier, 4);
        let b = GenerationJob::make_id(later, 0);
        assert_eq!(a, "1700000000000-4");
        assert!(b > a);
    }

    #[test]
    fn new_video_attempt_replaces_previous_result() {
        let mut j = job(GenerationMode::ImageThenVideo);
        j.complete_image("data:image/png;base64,AA==".to_string());
        assert!(j.begin_video());
        j.complete_video("blob:first".to_string());

        assert!(j.begin_video());
        assert_eq!(j.video_state, StageState::InProgress);
        assert!(j.video_url.is_none());
        assert_eq!(j.image_state, StageState::Done);
        assert!(j.image_url.is_some());
    }

    #[test]
    fn running_video_refuses_second_attempt() {
        let mut j = job(GenerationMode::VideoOnly);
        assert!(!j.begin_video());
    }

    #[test]
    fn failing_one_stage_leaves_the_other() {
        let mut j = job(GenerationMode::ImageThenVideo);
        j.complete_image("data:image/png;base64,AA==".to_string());
        j.begin_video();
        j.fail(Stage::Video, VIDEO_FAILED);
        assert_eq!(j.image_state, StageState::Done);
        assert_eq!(j.video_state, StageState::Failed);
        assert_eq!(j.error.as_deref(), Some(VIDEO_FAILED));
    }

    #[test]
    fn durable_copy_drops_video_handle() {
        let mut j = job(GenerationMode::VideoOnly);
        j.complete_video("blob:abc".to_string());
        let stored = j.durable();
        assert!(stored.video_url.is_none());
        assert_eq!(stored.video_state, StageState::Done);
        assert_eq!(stored.scene_prompt(), "a scene");
    }

    #[test]
    fn recovers_interrupted_stages() {
        let mut j = job(GenerationMode::ImageOnly);
        assert!(j.recover_interrupted());
        assert_eq!(j.image_state, StageState::Failed);
        assert_eq!(j.error.as_deref(), Some(INTERRUPTED));
        assert!(!j.recover_interrupted());
    }

    #[test]
    fn stage_state_round_trips_through_text() {
        for state in [
            StageState::Idle,
            StageState::InProgress,
            StageState::Done,
            StageState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<StageState>().unwrap(), state);
        }
        assert!("running".parse::<StageState>().is_err());
    }
}
