//! Per-request staging of uploads in a scoped temporary directory.
//!
//! The directory lives as long as [`StagedInput`]; dropping it removes the
//! uploads and the descriptor whichever way the request ends.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::TempDir;

use crate::{GenerateError, ReferenceKind, Result};

pub const AUDIO_FILE: &str = "audio.wav";
pub const DESCRIPTOR_FILE: &str = "input.json";
/// Speaker id the audio track is bound to in the descriptor.
pub const SPEAKER_ID: &str = "person1";

/// The `--input_json` document read by the generation script.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct InputDescriptor {
    pub prompt: String,
    pub cond_video: PathBuf,
    pub cond_audio: BTreeMap<String, PathBuf>,
}

#[derive(Debug)]
pub struct StagedInput {
    dir: TempDir,
    pub audio: PathBuf,
    pub reference: PathBuf,
    pub descriptor: PathBuf,
}

impl StagedInput {
    pub async fn create(
        root: &Path,
        prompt: &str,
        audio: &[u8],
        reference_kind: ReferenceKind,
        reference: &[u8],
    ) -> Result<Self> {
        let root_dir = root.to_path_buf();
        let dir = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&root_dir)
                .map_err(|e| GenerateError::io(format!("creating {}", root_dir.display()), e))?;
            tempfile::Builder::new()
                .prefix("talkhead-")
                .tempdir_in(&root_dir)
                .map_err(|e| GenerateError::io("allocating staging directory", e))
        })
        .await
        .map_err(|e| GenerateError::blocking("allocating staging directory", e))??;

        let audio_path = dir.path().join(AUDIO_FILE);
        write(&audio_path, audio).await?;

        let reference_path = dir.path().join(reference_kind.staged_name());
        write(&reference_path, reference).await?;

        let descriptor = InputDescriptor {
            prompt: prompt.to_string(),
            cond_video: reference_path.clone(),
            cond_audio: BTreeMap::from([(SPEAKER_ID.to_string(), audio_path.clone())]),
        };
        let descriptor_path = dir.path().join(DESCRIPTOR_FILE);
        write(&descriptor_path, &serde_json::to_vec(&descriptor)?).await?;

        Ok(Self {
            dir,
            audio: audio_path,
            reference: reference_path,
            descriptor: descriptor_path,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

async fn write(path: &Path, bytes: &[u8]) -> Result<()> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| GenerateError::io(format!("writing {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stages_files_and_descriptor() {
        let root = tempfile::tempdir().unwrap();
        let staged = StagedInput::create(
            &root.path().join("tmp"),
            "hello",
            b"audio-bytes",
            ReferenceKind::Image,
            b"png-bytes",
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(&staged.audio).unwrap(), b"audio-bytes");
        assert_eq!(std::fs::read(&staged.reference).unwrap(), b"png-bytes");
        assert!(staged.reference.ends_with("ref.png"));

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&staged.descriptor).unwrap()).unwrap();
        assert_eq!(json["prompt"], "hello");
        assert_eq!(json["cond_video"], staged.reference.display().to_string());
        assert_eq!(
            json["cond_audio"]["person1"],
            staged.audio.display().to_string()
        );
    }

    #[tokio::test]
    async fn directory_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let staged = StagedInput::create(
            root.path(),
            "p",
            b"a",
            ReferenceKind::Video,
            b"v",
        )
        .await
        .unwrap();
        let dir = staged.path().to_path_buf();
        assert!(dir.join("ref.mp4").is_file());

        drop(staged);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn root_that_is_a_file_is_io_error() {
        let root = tempfile::tempdir().unwrap();
        let blocked = root.path().join("tmp");
        std::fs::write(&blocked, b"not a directory").unwrap();

        let err = StagedInput::create(&blocked, "p", b"a", ReferenceKind::Image, b"i")
            .await
            .unwrap_err();
        assert!(matches!(err, GenerateError::Io { .. }), "{err:?}");
    }
}
