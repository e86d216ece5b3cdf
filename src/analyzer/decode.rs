use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Sample rate of the canonical PCM handed to feature extraction.
pub const CANONICAL_SAMPLE_RATE: u32 = 22050;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("decode failed (exit status {status:?})\nCMD: {command}\n{diagnostics}")]
    Failed {
        command: String,
        status: Option<i32>,
        diagnostics: String,
    },
    #[error("could not run `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("decoded audio is {channels} channel(s) at {sample_rate} Hz, expected mono at 22050 Hz")]
    Format { channels: u16, sample_rate: u32 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Canonical mono PCM, samples scaled to [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct Pcm {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Turns an audio file into canonical PCM.
pub trait Decoder: Send + Sync {
    fn decode(&self, source: &Path, mime: Option<&str>) -> Result<Pcm, DecodeError>;
}

/// Decoder that transcodes through an ffmpeg subprocess.
///
/// Linear PCM WAV that is already mono at [`CANONICAL_SAMPLE_RATE`] is read
/// directly; everything else goes through ffmpeg.
pub struct FfmpegDecoder {
    program: PathBuf,
    scratch_dir: Option<PathBuf>,
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegDecoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            scratch_dir: None,
        }
    }

    /// Create per-call workspaces under `dir` instead of the system temp dir.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    fn workspace(&self) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("autodj_");
        match &self.scratch_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        }
    }

    /// Run ffmpeg into a private workspace and read the result back.
    /// The workspace is removed when this returns, on every path.
    fn transcode(&self, source: &Path) -> Result<Pcm, DecodeError> {
        let workspace = self.workspace()?;
        let output = workspace.path().join("canonical.wav");

        let rate = CANONICAL_SAMPLE_RATE.to_string();
        let mut cmd = Command::new(&self.program);
        cmd.args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(source)
            .args(["-ac", "1", "-ar", rate.as_str(), "-vn", "-acodec", "pcm_s16le"])
            .arg(&output);
        let command = render_command(&cmd);
        log::debug!("Decoding: {command}");

        let out = cmd.output().map_err(|source| DecodeError::Spawn {
            command: command.clone(),
            source,
        })?;

        let produced = std::fs::metadata(&output)
            .map(|m| m.len() > 0)
            .unwrap_or(false);

        if !out.status.success() || !produced {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let stdout = String::from_utf8_lossy(&out.stdout);
            let mut diagnostics = format!("STDERR:\n{stderr}\nSTDOUT:\n{stdout}");
            if out.status.success() {
                diagnostics.insert_str(0, "output missing or empty\n");
            }
            return Err(DecodeError::Failed {
                command,
                status: out.status.code(),
                diagnostics,
            });
        }

        read_wav(&output)
    }
}

impl Decoder for FfmpegDecoder {
    fn decode(&self, source: &Path, mime: Option<&str>) -> Result<Pcm, DecodeError> {
        if is_wav(source, mime) && is_canonical_wav(source) {
            log::debug!("Reading canonical WAV directly: {}", source.display());
            return read_wav(source);
        }
        self.transcode(source)
    }
}

fn is_wav(path: &Path, mime: Option<&str>) -> bool {
    let by_mime = mime
        .map(|m| {
            let m = m.to_ascii_lowercase();
            matches!(m.as_str(), "audio/wav" | "audio/x-wav" | "audio/wave" | "audio/vnd.wave")
        })
        .unwrap_or(false);
    let by_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("wav"))
        .unwrap_or(false);
    by_mime || by_ext
}

/// Header says mono, canonical rate, and a sample format we can read as-is.
fn is_canonical_wav(path: &Path) -> bool {
    match hound::WavReader::open(path) {
        Ok(reader) => {
            let spec = reader.spec();
            let readable = matches!(
                (spec.sample_format, spec.bits_per_sample),
                (hound::SampleFormat::Int, 8 | 16 | 24 | 32) | (hound::SampleFormat::Float, 32)
            );
            spec.channels == 1 && spec.sample_rate == CANONICAL_SAMPLE_RATE && readable
        }
        Err(_) => false,
    }
}

/// Read a canonical (mono, [`CANONICAL_SAMPLE_RATE`]) WAV into normalized
/// f32 samples.
fn read_wav(path: &Path) -> Result<Pcm, DecodeError> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.sample_rate != CANONICAL_SAMPLE_RATE {
        return Err(DecodeError::Format {
            channels: spec.channels,
            sample_rate: spec.sample_rate,
        });
    }

    let samples = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    Ok(Pcm {
        samples,
        sample_rate: spec.sample_rate,
    })
}

fn render_command(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
