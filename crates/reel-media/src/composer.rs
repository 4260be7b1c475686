//! Scene composition.
//!
//! Each scene clip is normalized (scaled, padded, paired with its narration
//! or a silent track) into a segment with identical stream layout, then the
//! segments are joined with the concat demuxer in scene order.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use reel_models::VideoFormat;
use tracing::{info, instrument};

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};

/// Local media for one scene.
#[derive(Debug, Clone)]
pub struct SceneMedia {
    pub video: PathBuf,
    pub audio: Option<PathBuf>,
}

impl SceneMedia {
    pub fn new(video: impl Into<PathBuf>, audio: Option<PathBuf>) -> Self {
        Self {
            video: video.into(),
            audio,
        }
    }
}

/// Joins scene media into one playable video.
#[async_trait]
pub trait Composer: Send + Sync {
    /// Compose `scenes`, in the order given, into `output`.
    async fn compose(&self, scenes: &[SceneMedia], format: VideoFormat, output: &Path) -> MediaResult<()>;
}

/// Encoding settings shared by every segment.
#[derive(Debug, Clone)]
pub struct EncodingSettings {
    pub preset: String,
    pub crf: u8,
    pub audio_bitrate: String,
    pub frame_rate: u32,
}

impl Default for EncodingSettings {
    fn default() -> Self {
        Self {
            preset: "veryfast".to_string(),
            crf: 20,
            audio_bitrate: "128k".to_string(),
            frame_rate: 30,
        }
    }
}

/// [`Composer`] backed by the FFmpeg CLI.
#[derive(Debug, Clone, Default)]
pub struct FfmpegComposer {
    runner: FfmpegRunner,
    settings: EncodingSettings,
}

impl FfmpegComposer {
    pub fn new(runner: FfmpegRunner) -> Self {
        Self {
            runner,
            settings: EncodingSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: EncodingSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Command that turns one scene into a uniform segment.
    pub fn segment_command(&self, scene: &SceneMedia, format: VideoFormat, output: &Path) -> FfmpegCommand {
        let (width, height) = format.frame_size();
        let filter = format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps={fps}",
            w = width,
            h = height,
            fps = self.settings.frame_rate,
        );

        let cmd = FfmpegCommand::new(output).input(&scene.video);
        let cmd = match &scene.audio {
            Some(audio) => cmd.input(audio),
            None => cmd.input_with(["-f", "lavfi"], "anullsrc=channel_layout=stereo:sample_rate=44100"),
        };

        cmd.map("0:v:0")
            .map("1:a:0")
            .video_filter(filter)
            .video_codec("libx264")
            .preset(self.settings.preset.clone())
            .crf(self.settings.crf)
            .pixel_format("yuv420p")
            .audio_codec("aac")
            .audio_bitrate(self.settings.audio_bitrate.clone())
            .output_args(["-ar", "44100", "-ac", "2"])
            .shortest()
    }

    /// Command that joins already-uniform segments listed in `list_file`.
    pub fn concat_command(&self, list_file: &Path, output: &Path) -> FfmpegCommand {
        FfmpegCommand::new(output)
            .input_with(["-f", "concat", "-safe", "0"], list_file)
            .output_args(["-c", "copy", "-movflags", "+faststart"])
    }
}

#[async_trait]
impl Composer for FfmpegComposer {
    #[instrument(skip(self, scenes), fields(scene_count = scenes.len()))]
    async fn compose(&self, scenes: &[SceneMedia], format: VideoFormat, output: &Path) -> MediaResult<()> {
        if scenes.is_empty() {
            return Err(MediaError::empty_input("no scenes to compose"));
        }
        for scene in scenes {
            if !scene.video.exists() {
                return Err(MediaError::FileNotFound(scene.video.clone()));
            }
        }

        let start = Instant::now();
        let parent = output.parent().unwrap_or_else(|| Path::new("."));
        let work = tempfile::Builder::new().prefix("compose-").tempdir_in(parent)?;

        let mut segments = Vec::with_capacity(scenes.len());
        for (position, scene) in scenes.iter().enumerate() {
            let segment = work.path().join(format!("segment_{:04}.mp4", position));
            self.runner.run(&self.segment_command(scene, format, &segment)).await?;
            segments.push(segment);
        }

        let list_file = work.path().join("segments.txt");
        tokio::fs::write(&list_file, concat_list(&segments)).await?;
        self.runner.run(&self.concat_command(&list_file, output)).await?;

        let elapsed = start.elapsed();
        histogram!("media_compose_duration_seconds").record(elapsed.as_secs_f64());
        counter!("media_compose_scenes_total").increment(scenes.len() as u64);
        info!(
            output = %output.display(),
            duration_ms = elapsed.as_millis() as u64,
            "Composed {} scenes",
            scenes.len()
        );

        Ok(())
    }
}

/// Concat demuxer list, one quoted path per line.
pub fn concat_list(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', "'\\''")))
        .collect()
}
