//! Video transcoding through ffmpeg

use fileproc_core::models::{OutputKind, ProcessedOutput};
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::command::{CommandError, CommandRunner};

pub const SUPPORTED_FORMATS: &[&str] = &["mp4", "mkv", "webm", "mov"];

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("invalid transcode parameters: {0}")]
    InvalidParameters(String),

    #[error("ffmpeg invocation failed: {0}")]
    Ffmpeg(#[from] CommandError),

    #[error("failed to stat transcoded file {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TranscodeError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TranscodeError::InvalidParameters(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quality {
    Low,
    Medium,
    High,
}

fn parse_quality(quality: &str) -> Result<Quality, TranscodeError> {
    match quality.trim().to_ascii_lowercase().as_str() {
        "low" => Ok(Quality::Low),
        "medium" => Ok(Quality::Medium),
        "high" => Ok(Quality::High),
        other => Err(TranscodeError::InvalidParameters(format!(
            "unknown quality '{}'",
            other
        ))),
    }
}

/// Encoder pair for a target container.
///
/// WebM only accepts VP8/VP9/AV1 video with Vorbis/Opus audio, everything
/// else gets H.264 and AAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoder {
    H264,
    Vp9,
}

impl Encoder {
    fn for_format(format: &str) -> Self {
        match format {
            "webm" => Encoder::Vp9,
            _ => Encoder::H264,
        }
    }

    fn video_codec(self) -> &'static str {
        match self {
            Encoder::H264 => "libx264",
            Encoder::Vp9 => "libvpx-vp9",
        }
    }

    fn audio_codec(self) -> &'static str {
        match self {
            Encoder::H264 => "aac",
            Encoder::Vp9 => "libopus",
        }
    }

    /// Codec name as ffprobe reports it for the produced stream.
    fn codec_name(self) -> &'static str {
        match self {
            Encoder::H264 => "h264",
            Encoder::Vp9 => "vp9",
        }
    }

    /// Constant rate factor; libvpx-vp9 uses a 0-63 scale.
    fn crf(self, quality: Quality) -> u8 {
        match (self, quality) {
            (Encoder::H264, Quality::Low) => 28,
            (Encoder::H264, Quality::Medium) => 23,
            (Encoder::H264, Quality::High) => 18,
            (Encoder::Vp9, Quality::Low) => 40,
            (Encoder::Vp9, Quality::Medium) => 32,
            (Encoder::Vp9, Quality::High) => 24,
        }
    }

    fn args(self, crf: u8) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-c:v".into(),
            self.video_codec().into(),
            "-crf".into(),
            crf.to_string().into(),
        ];
        if self == Encoder::Vp9 {
            // Constant quality mode needs the bitrate cap disabled.
            args.extend([OsString::from("-b:v"), OsString::from("0")]);
        }
        args.extend([OsString::from("-c:a"), OsString::from(self.audio_codec())]);
        args
    }
}

/// Parse `WIDTHxHEIGHT` with both sides positive.
fn parse_resolution(resolution: &str) -> Result<(i32, i32), TranscodeError> {
    let invalid = || TranscodeError::InvalidParameters(format!("bad resolution '{}'", resolution));
    let (w, h) = resolution.split_once('x').ok_or_else(invalid)?;
    let width: i32 = w.trim().parse().map_err(|_| invalid())?;
    let height: i32 = h.trim().parse().map_err(|_| invalid())?;
    if width <= 0 || height <= 0 {
        return Err(invalid());
    }
    Ok((width, height))
}

#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    /// Directory holding the source; the output is written beside it.
    pub dir: PathBuf,
    pub filename: String,
    pub format: String,
    pub quality: String,
    pub resolution: String,
}

pub struct VideoTranscoder {
    runner: Arc<dyn CommandRunner>,
    ffmpeg_path: String,
}

impl VideoTranscoder {
    pub fn new(runner: Arc<dyn CommandRunner>, ffmpeg_path: impl Into<String>) -> Self {
        Self {
            runner,
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    #[tracing::instrument(skip(self, cancel), fields(
        process.executable.name = "ffmpeg",
        process.executable.path = %self.ffmpeg_path,
        ffmpeg.operation = "transcode"
    ))]
    pub async fn transcode(
        &self,
        request: &TranscodeRequest,
        cancel: &CancellationToken,
    ) -> Result<ProcessedOutput, TranscodeError> {
        if request.filename.is_empty() {
            return Err(TranscodeError::InvalidParameters(
                "filename is empty".to_string(),
            ));
        }
        let format = request.format.trim().to_ascii_lowercase();
        if !SUPPORTED_FORMATS.contains(&format.as_str()) {
            return Err(TranscodeError::InvalidParameters(format!(
                "unsupported format '{}'",
                request.format
            )));
        }
        let quality = parse_quality(&request.quality)?;
        let encoder = Encoder::for_format(&format);
        let crf = encoder.crf(quality);
        let (width, height) = parse_resolution(&request.resolution)?;

        let dir = request.dir.as_path();
        let id = Uuid::new_v4();
        let name = format!("transcoded_{}.{}", id, format);
        let output_path = dir.join(&name);

        let mut args: Vec<OsString> = vec![
            "-y".into(),
            "-i".into(),
            dir.join(&request.filename).into_os_string(),
            "-vf".into(),
            format!("scale={}:{}", width, height).into(),
        ];
        args.extend(encoder.args(crf));
        args.push(output_path.clone().into_os_string());

        self.runner.run(&self.ffmpeg_path, &args, cancel).await?;

        let size = tokio::fs::metadata(&output_path)
            .await
            .map_err(|source| TranscodeError::Output {
                path: output_path.clone(),
                source,
            })?
            .len() as i64;

        tracing::info!(
            output = %output_path.display(),
            resolution = %request.resolution,
            codec = encoder.codec_name(),
            crf = crf,
            size = size,
            "Video transcoded"
        );

        let mut output = ProcessedOutput::new(OutputKind::TranscodedVideo);
        output.id = Some(id);
        output.storage_path = dir.to_string_lossy().into_owned();
        output.name = name;
        output.extension = format.clone();
        output.format = format;
        output.width = width;
        output.height = height;
        output.resolution = format!("{}x{}", width, height);
        output.size = size;
        output.codec = encoder.codec_name().to_string();
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    /// Pretends to be ffmpeg by writing a few bytes to the last argument.
    #[derive(Default)]
    struct FakeFfmpeg {
        calls: Mutex<Vec<Vec<OsString>>>,
    }

    #[async_trait]
    impl CommandRunner for FakeFfmpeg {
        async fn run(
            &self,
            _program: &str,
            args: &[OsString],
            _cancel: &CancellationToken,
        ) -> Result<CommandOutput, CommandError> {
            self.calls.lock().unwrap().push(args.to_vec());
            let out = args.last().unwrap();
            std::fs::write(out, b"fake video").unwrap();
            Ok(CommandOutput::default())
        }
    }

    fn request(dir: &Path) -> TranscodeRequest {
        TranscodeRequest {
            dir: dir.to_path_buf(),
            filename: "clip.mov".to_string(),
            format: "mp4".to_string(),
            quality: "high".to_string(),
            resolution: "1280x720".to_string(),
        }
    }

    #[tokio::test]
    async fn transcode_builds_ffmpeg_command_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeFfmpeg::default());
        let transcoder = VideoTranscoder::new(runner.clone(), "ffmpeg");

        let output = transcoder
            .transcode(&request(dir.path()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.kind, OutputKind::TranscodedVideo);
        assert_eq!(output.resolution, "1280x720");
        assert_eq!(output.size, 10);
        assert!(output.name.starts_with("transcoded_"));
        assert!(output.name.ends_with(".mp4"));
        assert_eq!(
            output.name,
            format!("transcoded_{}.mp4", output.id.unwrap())
        );

        assert_eq!(output.codec, "h264");

        let args = recorded_args(&runner, 0);
        assert!(args.windows(2).any(|w| w == ["-vf", "scale=1280:720"]));
        assert!(args.windows(2).any(|w| w == ["-crf", "18"]));
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
    }

    fn recorded_args(runner: &FakeFfmpeg, call: usize) -> Vec<String> {
        runner.calls.lock().unwrap()[call]
            .iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    #[tokio::test]
    async fn encoders_follow_the_container() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeFfmpeg::default());
        let transcoder = VideoTranscoder::new(runner.clone(), "ffmpeg");

        let mut webm = request(dir.path());
        webm.format = "WebM".to_string();
        webm.quality = "medium".to_string();
        let output = transcoder
            .transcode(&webm, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.codec, "vp9");
        assert!(output.name.ends_with(".webm"));

        let args = recorded_args(&runner, 0);
        assert!(args.windows(2).any(|w| w == ["-c:v", "libvpx-vp9"]));
        assert!(args.windows(2).any(|w| w == ["-c:a", "libopus"]));
        assert!(args.windows(2).any(|w| w == ["-b:v", "0"]));
        assert!(args.windows(2).any(|w| w == ["-crf", "32"]));
        assert!(!args.iter().any(|a| a == "libx264" || a == "aac"));

        let mut mkv = request(dir.path());
        mkv.format = "mkv".to_string();
        let output = transcoder
            .transcode(&mkv, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.codec, "h264");

        let args = recorded_args(&runner, 1);
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
        assert!(args.windows(2).any(|w| w == ["-c:a", "aac"]));
        assert!(!args.iter().any(|a| a == "-b:v"));
    }

    #[tokio::test]
    async fn invalid_parameters_never_invoke_ffmpeg() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeFfmpeg::default());
        let transcoder = VideoTranscoder::new(runner.clone(), "ffmpeg");

        let mut bad_format = request(dir.path());
        bad_format.format = "flv".to_string();
        let mut bad_quality = request(dir.path());
        bad_quality.quality = "ultra".to_string();
        let mut bad_resolution = request(dir.path());
        bad_resolution.resolution = "0x720".to_string();

        for req in [bad_format, bad_quality, bad_resolution] {
            let err = transcoder
                .transcode(&req, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, TranscodeError::InvalidParameters(_)));
            assert!(!err.is_recoverable());
        }
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn resolution_parsing() {
        assert_eq!(parse_resolution("640x360").unwrap(), (640, 360));
        assert!(parse_resolution("640").is_err());
        assert!(parse_resolution("axb").is_err());
        assert!(parse_resolution("-1x10").is_err());
    }
}
