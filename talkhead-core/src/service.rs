use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::staging::StagedInput;
use crate::weights::{ensure_ready, HealthReport};
use crate::{GenerateError, GenerationParams, GenerationRequest, Invocation, Result, ServiceConfig};

/// URL prefix under which finished videos are published.
pub const FILES_PREFIX: &str = "/files";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutcome {
    pub file_name: String,
    /// Public path of the video, e.g. `/files/<name>.mp4`.
    pub video_file: String,
    pub path: PathBuf,
    pub params: GenerationParams,
}

/// Validates, stages and runs one generation request end to end.
#[derive(Debug, Clone)]
pub struct VideoService {
    config: Arc<ServiceConfig>,
}

impl VideoService {
    pub fn new(config: Arc<ServiceConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Filesystem readiness snapshot, taken off the async workers.
    pub async fn health(&self) -> Result<HealthReport> {
        let config = Arc::clone(&self.config);
        tokio::task::spawn_blocking(move || HealthReport::check(&config))
            .await
            .map_err(|e| GenerateError::blocking("checking service health", e))
    }

    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutcome> {
        let (reference_kind, reference) = request.validate()?;
        let config = Arc::clone(&self.config);
        tokio::task::spawn_blocking(move || ensure_ready(&config))
            .await
            .map_err(|e| GenerateError::blocking("checking weights", e))??;

        let staged = StagedInput::create(
            &self.config.staging_root(),
            &request.prompt,
            &request.audio,
            reference_kind,
            reference,
        )
        .await?;

        let file_name = format!("{}.mp4", Uuid::new_v4().simple());
        let path = self.config.out_dir.join(&file_name);
        let params = request.params();
        info!(
            file = %file_name,
            mode = %params.mode,
            sample_steps = params.sample_steps,
            reference = ?reference_kind,
            "starting generation"
        );

        let started = Instant::now();
        let invocation = Invocation::generate(
            &self.config,
            &staged.descriptor,
            params.mode,
            params.sample_steps,
            &path,
        );
        let output = match invocation
            .run()
            .instrument(info_span!("generation", file = %file_name))
            .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!(file = %file_name, error = %e, "generation failed");
                return Err(e);
            }
        };

        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            warn!(file = %file_name, "generation exited cleanly without writing output");
            return Err(GenerateError::inference(
                Some(output.status),
                format!("script wrote no output file at {}", path.display()),
            ));
        }

        info!(
            file = %file_name,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "generation finished"
        );

        Ok(GenerationOutcome {
            video_file: format!("{FILES_PREFIX}/{file_name}"),
            file_name,
            path,
            params,
        })
    }
}
