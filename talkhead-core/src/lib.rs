pub mod config;
pub mod error;
pub mod fetch;
pub mod invocation;
pub mod service;
pub mod staging;
pub mod weights;

pub use config::ServiceConfig;
pub use error::{GenerateError, Result};
pub use fetch::WeightFetcher;
pub use invocation::{Invocation, InvocationOutput};
pub use service::{GenerationOutcome, VideoService};
pub use weights::{HealthReport, WeightBundle};

use serde::{Deserialize, Serialize};

pub const DEFAULT_PROMPT: &str = "A person talking";
pub const DEFAULT_SAMPLE_STEPS: u32 = 40;

/// Generation strategy handed to the script via `--mode`.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Fixed-length single pass.
    Clip,
    /// Incremental long-form generation.
    #[default]
    Streaming,
}

serde_plain::derive_display_from_serialize!(Mode);
serde_plain::derive_fromstr_from_deserialize!(Mode);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceKind {
    Image,
    Video,
}

impl ReferenceKind {
    /// File name the reference is staged under.
    pub fn staged_name(self) -> &'static str {
        match self {
            Self::Image => "ref.png",
            Self::Video => "ref.mp4",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub mode: Mode,
    pub sample_steps: u32,
    pub audio: Vec<u8>,
    pub ref_image: Option<Vec<u8>>,
    pub ref_video: Option<Vec<u8>>,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            mode: Mode::default(),
            sample_steps: DEFAULT_SAMPLE_STEPS,
            audio: Vec::new(),
            ref_image: None,
            ref_video: None,
        }
    }
}

impl GenerationRequest {
    /// The single reference medium of the request. Supplying neither or both
    /// is a client error.
    pub fn reference(&self) -> Result<(ReferenceKind, &[u8])> {
        match (&self.ref_image, &self.ref_video) {
            (Some(image), None) => Ok((ReferenceKind::Image, image.as_slice())),
            (None, Some(video)) => Ok((ReferenceKind::Video, video.as_slice())),
            (None, None) => Err(GenerateError::invalid(
                "send exactly one of ref_image or ref_video",
            )),
            (Some(_), Some(_)) => Err(GenerateError::invalid(
                "ref_image and ref_video are mutually exclusive; send only one",
            )),
        }
    }

    pub fn validate(&self) -> Result<(ReferenceKind, &[u8])> {
        if self.audio.is_empty() {
            return Err(GenerateError::invalid("audio file is required"));
        }
        if self.sample_steps == 0 {
            return Err(GenerateError::invalid("sample_steps must be a positive integer"));
        }
        self.reference()
    }

    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            mode: self.mode,
            sample_steps: self.sample_steps,
        }
    }
}

/// Parameters echoed back to the caller.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationParams {
    pub mode: Mode,
    pub sample_steps: u32,
}
