// ffprobe/ffmpeg collaborator.
//
// Rendering is three ffmpeg runs inside the attempt's scratch dir:
//   1. trim leading/trailing silence, transcode to AAC 44.1k/128k
//   2. null-decode the AAC and read the last `time=` stamp (true duration)
//   3. showcqt visualizer + scrolling drawtext overlay + fades -> CBR x264 FLV
//
// Binaries come from PATH unless REELQUEUE_FFMPEG / REELQUEUE_FFPROBE are set.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::quality::QualityState;

/// Fade in/out length in seconds.
const FADE_SECONDS: f64 = 5.0;

const AUDIO_FILE: &str = "audio.aac";
const OVERLAY_FILE: &str = "overlay.txt";
const RENDER_FILE: &str = "render.flv";

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeInfo {
    pub title: String,
    pub artist: Option<String>,
    pub comment: Option<String>,
    pub duration_seconds: f64,
    pub file_name: String,
}

#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub input: PathBuf,
    pub overlay_text: String,
    pub quality: QualityState,
    /// Directory for intermediates and the rendered output.
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedMedia {
    pub output_file: PathBuf,
    pub duration_seconds: f64,
}

#[derive(Debug, Error)]
pub enum MediaError {
    /// The binary could not be started at all. Nothing later will work either.
    #[error("failed to launch {program}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("probe reported no {0}")]
    MissingField(&'static str),
    #[error("encoder produced an empty file")]
    EmptyOutput,
    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait MediaTool: Send + Sync {
    async fn probe(&self, file: &Path) -> Result<ProbeInfo, MediaError>;
    async fn encode(&self, req: &EncodeRequest) -> Result<EncodedMedia, MediaError>;
}

/// Parse `ffprobe -show_format -print_format json` output. Tag keys are
/// matched case-insensitively; a missing title or duration is an error.
pub fn parse_probe_json(raw: &[u8], file_name: &str) -> Result<ProbeInfo, MediaError> {
    let v: serde_json::Value = serde_json::from_slice(raw)
        .map_err(|e| MediaError::Failed(format!("unparseable probe output: {e}")))?;
    let format = v
        .get("format")
        .ok_or(MediaError::MissingField("format section"))?;

    let tag = |name: &str| -> Option<String> {
        format
            .get("tags")?
            .as_object()?
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_str())
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty())
    };

    let title = tag("title").ok_or(MediaError::MissingField("title"))?;
    let duration_seconds = match format.get("duration") {
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        _ => None,
    }
    .filter(|d| d.is_finite() && *d > 0.0)
    .ok_or(MediaError::MissingField("duration"))?;

    Ok(ProbeInfo {
        title,
        artist: tag("artist"),
        comment: tag("comment"),
        duration_seconds,
        file_name: file_name.to_string(),
    })
}

/// Seconds from the last `time=HH:MM:SS.ss` stamp in ffmpeg's log output.
pub fn parse_time_stamp(log: &str) -> Option<f64> {
    let idx = log.rfind("time=")?;
    let stamp = log[idx + "time=".len()..].split_whitespace().next()?;
    let mut total = 0.0;
    for (part, scale) in stamp.rsplit(':').zip([1.0, 60.0, 3600.0]) {
        total += part.parse::<f64>().ok()? * scale;
    }
    total.is_finite().then_some(total)
}

/// Escape a path for use as a filter option value inside a filtergraph:
/// first the option level, then the graph level.
pub fn escape_filter_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let mut option = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | ':' | '\'') {
            option.push('\\');
        }
        option.push(c);
    }
    let mut graph = String::with_capacity(option.len());
    for c in option.chars() {
        if matches!(c, '\\' | '\'' | '[' | ']' | ',' | ';') {
            graph.push('\\');
        }
        graph.push(c);
    }
    graph
}

/// The visualizer filtergraph for a track of `duration` seconds.
pub fn render_filter(font: &Path, overlay: &Path, duration: f64) -> String {
    let fade_out = (duration - FADE_SECONDS).max(0.0);
    format!(
        "[0:a]showcqt=sono_h=0:axis=0:s=1920x1080:fps=30:bar_h=1080:cscheme=1|0|1|0|1|0:csp=bt470bg[cqt];\
         [cqt]hflip[flip];\
         [flip]drawtext=fontfile={font}:textfile={text}:expansion=none:fontsize=24:fontcolor=white:x=20:\
         y=h-mod(max(t-0.0\\,0)*(h+th)/50.0\\,(h+th))[txt];\
         [txt]fade=t=in:st=0:d={fade},fade=t=out:st={fade_out:.3}:d={fade}[out]",
        font = escape_filter_path(font),
        text = escape_filter_path(overlay),
        fade = FADE_SECONDS,
    )
}

/// Best line of ffmpeg's stderr to put in a log message.
fn stderr_summary(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    lines
        .iter()
        .rev()
        .find(|l| !l.to_ascii_lowercase().contains("conversion failed"))
        .or(lines.last())
        .map(|l| l.to_string())
        .unwrap_or_else(|| "no diagnostic output".to_string())
}

pub struct Ffmpeg {
    ffmpeg: String,
    ffprobe: String,
    font: PathBuf,
}

impl Ffmpeg {
    pub fn from_env(font: PathBuf) -> Self {
        Self {
            ffmpeg: std::env::var("REELQUEUE_FFMPEG").unwrap_or_else(|_| "ffmpeg".to_string()),
            ffprobe: std::env::var("REELQUEUE_FFPROBE").unwrap_or_else(|_| "ffprobe".to_string()),
            font,
        }
    }

    async fn run(&self, program: &str, cmd: &mut Command) -> Result<Output, MediaError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.output().await.map_err(|source| MediaError::Launch {
            program: program.to_string(),
            source,
        })
    }

    async fn run_ffmpeg(&self, step: &str, cmd: &mut Command) -> Result<Output, MediaError> {
        let out = self.run(&self.ffmpeg, cmd).await?;
        if !out.status.success() {
            return Err(MediaError::Failed(format!(
                "{step} failed ({}): {}",
                out.status,
                stderr_summary(&out.stderr)
            )));
        }
        Ok(out)
    }

    fn ffmpeg_cmd(&self, loglevel: &str) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-nostdin")
            .arg("-hide_banner")
            .arg("-nostats")
            .arg("-loglevel")
            .arg(loglevel)
            .arg("-y");
        cmd
    }
}

#[async_trait]
impl MediaTool for Ffmpeg {
    async fn probe(&self, file: &Path) -> Result<ProbeInfo, MediaError> {
        debug!("probing {}", file.display());
        let mut cmd = Command::new(&self.ffprobe);
        cmd.arg("-v")
            .arg("quiet")
            .arg("-print_format")
            .arg("json=compact=1")
            .arg("-show_format")
            .arg(file);
        let out = self.run(&self.ffprobe, &mut cmd).await?;
        if !out.status.success() {
            return Err(MediaError::Failed(format!("ffprobe exited with {}", out.status)));
        }
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        parse_probe_json(&out.stdout, &name)
    }

    async fn encode(&self, req: &EncodeRequest) -> Result<EncodedMedia, MediaError> {
        let audio = req.work_dir.join(AUDIO_FILE);
        let overlay = req.work_dir.join(OVERLAY_FILE);
        let output = req.work_dir.join(RENDER_FILE);

        let mut trim = self.ffmpeg_cmd("warning");
        trim.arg("-i")
            .arg(&req.input)
            .arg("-af")
            .arg("silenceremove=start_periods=1:stop_periods=1:detection=peak")
            .arg("-ar")
            .arg("44100")
            .arg("-c:a")
            .arg("aac")
            .arg("-b:a")
            .arg("128k")
            .arg(&audio);
        self.run_ffmpeg("silence trim", &mut trim).await?;

        // The trim changes the length; the container duration is not trusted.
        let mut measure = self.ffmpeg_cmd("info");
        measure
            .arg("-i")
            .arg(&audio)
            .arg("-f")
            .arg("null")
            .arg("-c")
            .arg("copy")
            .arg("-");
        let out = self.run_ffmpeg("duration measurement", &mut measure).await?;
        let log = String::from_utf8_lossy(&out.stderr);
        let duration = parse_time_stamp(&log)
            .filter(|d| *d > 0.0)
            .ok_or(MediaError::MissingField("decoded duration"))?;
        debug!("true duration of {} is {duration:.2}s", req.input.display());

        tokio::fs::write(&overlay, &req.overlay_text)
            .await
            .map_err(|e| MediaError::Failed(format!("failed to write overlay text: {e}")))?;

        info!(
            "rendering {} (preset {}, crf {})",
            req.input.display(),
            req.quality.preset_name(),
            req.quality.quality_factor
        );
        let mut render = self.ffmpeg_cmd("warning");
        render
            .arg("-i")
            .arg(&audio)
            .arg("-filter_complex")
            .arg(render_filter(&self.font, &overlay, duration))
            .arg("-map")
            .arg("[out]")
            .arg("-map")
            .arg("0:a")
            .arg("-c:v")
            .arg("libx264")
            .arg("-x264-params")
            .arg("nal-hrd=cbr:force-cfr=1")
            .arg("-b:v")
            .arg("4.5M")
            .arg("-preset")
            .arg(req.quality.preset_name())
            .arg("-tune")
            .arg("fastdecode")
            .arg("-crf")
            .arg(req.quality.quality_factor.to_string())
            .arg("-maxrate")
            .arg("4.5M")
            .arg("-minrate")
            .arg("4.5M")
            .arg("-bufsize")
            .arg("9M")
            .arg("-ar")
            .arg("44100")
            .arg("-c:a")
            .arg("copy")
            .arg("-g")
            .arg("4")
            .arg("-f")
            .arg("flv")
            .arg(&output);
        self.run_ffmpeg("render", &mut render).await?;

        let size = tokio::fs::metadata(&output).await.map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(MediaError::EmptyOutput);
        }

        Ok(EncodedMedia {
            output_file: output,
            duration_seconds: duration,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable media tool for controller tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeMediaTool {
        probes: Mutex<HashMap<String, ProbeInfo>>,
        encoded: Mutex<Vec<EncodeRequest>>,
        launch_broken: Mutex<bool>,
    }

    impl FakeMediaTool {
        pub fn new() -> Self {
            Self::default()
        }

        /// Probe answer for a local file name.
        pub fn knows(&self, file_name: &str, title: &str, duration_seconds: f64) {
            self.probes.lock().unwrap().insert(
                file_name.to_string(),
                ProbeInfo {
                    title: title.to_string(),
                    artist: None,
                    comment: None,
                    duration_seconds,
                    file_name: file_name.to_string(),
                },
            );
        }

        pub fn break_launch(&self) {
            *self.launch_broken.lock().unwrap() = true;
        }

        pub fn encoded_inputs(&self) -> Vec<String> {
            self.encoded
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.input.file_name().unwrap().to_string_lossy().to_string())
                .collect()
        }

        pub fn last_request(&self) -> Option<EncodeRequest> {
            self.encoded.lock().unwrap().last().cloned()
        }

        fn check_launch(&self) -> Result<(), MediaError> {
            if *self.launch_broken.lock().unwrap() {
                return Err(MediaError::Launch {
                    program: "ffmpeg".into(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl MediaTool for FakeMediaTool {
        async fn probe(&self, file: &Path) -> Result<ProbeInfo, MediaError> {
            self.check_launch()?;
            let name = file.file_name().unwrap().to_string_lossy().to_string();
            self.probes
                .lock()
                .unwrap()
                .get(&name)
                .cloned()
                .ok_or(MediaError::MissingField("title"))
        }

        async fn encode(&self, req: &EncodeRequest) -> Result<EncodedMedia, MediaError> {
            self.check_launch()?;
            let name = req.input.file_name().unwrap().to_string_lossy().to_string();
            let duration = self
                .probes
                .lock()
                .unwrap()
                .get(&name)
                .map(|p| p.duration_seconds)
                .unwrap_or(60.0);
            let output_file = req.work_dir.join(RENDER_FILE);
            tokio::fs::write(&output_file, b"FLV\x01").await.unwrap();
            self.encoded.lock().unwrap().push(req.clone());
            Ok(EncodedMedia {
                output_file,
                duration_seconds: duration,
            })
        }
    }
}
