#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod device_map;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod loader;
mod loader_factory;
mod util;

mod flux;

pub use device_map::*;
pub use dispatcher::{Dispatcher, DispatcherConfig, RunSummary, Worker};
pub use error::*;
pub use flux::{FluxEngine, FluxLoader, FluxVariant};
use image::DynamicImage;
pub use job::{Handle, JobId, JobState, Outcome};
pub use loader::*;
pub use loader_factory::*;
use serde::{Deserialize, Serialize};
pub(crate) use util::*;

/// Validated parameters for one image generation call.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct GenerationParams {
    pub prompt: String,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub seed: u64,
}

impl GenerationParams {
    pub fn new(
        prompt: impl Into<String>,
        width: usize,
        height: usize,
        steps: usize,
        seed: u64,
    ) -> Result<Self, GenerationError> {
        let params = Self {
            prompt: prompt.into(),
            width,
            height,
            steps,
            seed,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.prompt.trim().is_empty() {
            return Err(GenerationError::InvalidParams("prompt must not be empty".into()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(GenerationError::InvalidParams(format!(
                "image size must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.steps == 0 {
            return Err(GenerationError::InvalidParams("steps must be positive".into()));
        }
        Ok(())
    }
}

/// A loaded text-to-image model.
///
/// `generate` is blocking and takes `&mut self`: an engine carries per-call
/// generator state and must never run two generations at once. The
/// [`Dispatcher`] owns the engine and funnels every call through one worker.
pub trait Engine: Send {
    fn name(&self) -> &str;

    fn generate(&mut self, params: &GenerationParams) -> Result<DynamicImage, GenerationError>;
}
