use std::path::Path;

use serde::Serialize;

use crate::{GenerateError, Result, ServiceConfig};

/// The three pretrained bundles the generation script loads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WeightBundle {
    /// Base image-to-video diffusion model.
    Wan,
    /// Talking-head adapter weights.
    InfiniteTalk,
    /// Audio encoder.
    Wav2Vec,
}

impl WeightBundle {
    pub const ALL: [WeightBundle; 3] = [Self::Wan, Self::InfiniteTalk, Self::Wav2Vec];

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Wan => "Wan2.1-I2V-14B-480P",
            Self::InfiniteTalk => "InfiniteTalk",
            Self::Wav2Vec => "chinese-wav2vec2-base",
        }
    }

    /// Hugging Face hub repository the bundle is fetched from.
    pub fn repo_id(self) -> &'static str {
        match self {
            Self::Wan => "Wan-AI/Wan2.1-I2V-14B-480P",
            Self::InfiniteTalk => "MeiGen-AI/InfiniteTalk",
            Self::Wav2Vec => "TencentGameMate/chinese-wav2vec2-base",
        }
    }
}

/// A bundle counts as present once its directory holds at least one entry.
pub fn dir_is_populated(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    pub wan: bool,
    pub infinitetalk: bool,
    pub wav2vec: bool,
    pub code_dir_present: bool,
    pub generate_script: bool,
    pub out_dir: bool,
}

impl HealthReport {
    pub fn check(config: &ServiceConfig) -> Self {
        Self {
            wan: dir_is_populated(&config.bundle_dir(WeightBundle::Wan)),
            infinitetalk: dir_is_populated(&config.bundle_dir(WeightBundle::InfiniteTalk)),
            wav2vec: dir_is_populated(&config.bundle_dir(WeightBundle::Wav2Vec)),
            code_dir_present: config.code_dir.is_dir(),
            generate_script: config.script_path().is_file(),
            out_dir: config.out_dir.is_dir(),
        }
    }

    pub fn ok(&self) -> bool {
        self.wan
            && self.infinitetalk
            && self.wav2vec
            && self.code_dir_present
            && self.generate_script
            && self.out_dir
    }
}

/// Fails with [`GenerateError::Unavailable`] unless every bundle is
/// populated and the generation script exists.
pub fn ensure_ready(config: &ServiceConfig) -> Result<()> {
    let mut missing: Vec<String> = WeightBundle::ALL
        .into_iter()
        .filter(|bundle| !dir_is_populated(&config.bundle_dir(*bundle)))
        .map(|bundle| config.bundle_dir(bundle).display().to_string())
        .collect();
    let script = config.script_path();
    if !script.is_file() {
        missing.push(script.display().to_string());
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(GenerateError::Unavailable(format!(
            "weights or generation code missing ({}); run `talkhead-server fetch-weights` and check the code checkout",
            missing.join(", ")
        )))
    }
}
