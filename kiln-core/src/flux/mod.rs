use std::time::Instant;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Module, VarBuilder};
use candle_transformers::models::{
    clip::text_model::{Activation, ClipTextConfig, ClipTextTransformer},
    flux::{self, autoencoder::AutoEncoder, model::Flux, sampling},
    t5::{self, T5EncoderModel},
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tokenizers::Tokenizer;

use crate::{
    select_best_device, tensor_to_image, DeviceMap, Engine, GenerationError, GenerationParams,
    LoadError, Loader, Precision,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    Schnell,
    Dev,
}

impl FluxVariant {
    fn repo(self) -> &'static str {
        match self {
            Self::Schnell => "black-forest-labs/FLUX.1-schnell",
            Self::Dev => "black-forest-labs/FLUX.1-dev",
        }
    }

    fn weights_file(self) -> &'static str {
        match self {
            Self::Schnell => "flux1-schnell.safetensors",
            Self::Dev => "flux1-dev.safetensors",
        }
    }

    /// Schnell is guidance-distilled and ignores guidance entirely.
    fn guidance(self) -> f64 {
        match self {
            Self::Schnell => 0.0,
            Self::Dev => 3.5,
        }
    }

    fn t5_tokens(self) -> usize {
        match self {
            Self::Schnell => 256,
            Self::Dev => 512,
        }
    }
}

/// Latents are 8x downsampled and then packed 2x2.
const SIZE_MULTIPLE: usize = 16;

const LATENT_CHANNELS: usize = 16;

/// Initial latent noise for one image, drawn on the host from `seed` so the
/// same seed gives the same noise on every device.
///
/// Same shape as `sampling::get_noise`: `(1, 16, ceil(h/16)*2, ceil(w/16)*2)`.
fn seeded_noise(
    seed: u64,
    height: usize,
    width: usize,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let height = height.div_ceil(SIZE_MULTIPLE) * 2;
    let width = width.div_ceil(SIZE_MULTIPLE) * 2;
    let len = LATENT_CHANNELS * height * width;
    let mut rng = StdRng::seed_from_u64(seed);
    let values: Vec<f32> = (0..len).map(|_| rng.sample(StandardNormal)).collect();
    Tensor::from_vec(values, (1, LATENT_CHANNELS, height, width), device)
}

pub struct FluxEngine {
    name: String,
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    flux_model: Flux,
}

impl FluxEngine {
    fn text_embeddings(&mut self, prompt: &str) -> Result<(Tensor, Tensor)> {
        let mut t5_tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(self.variant.t5_tokens(), 0);
        let t5_input = Tensor::new(&*t5_tokens, &self.device)?.unsqueeze(0)?;
        let t5_emb = self.t5_model.forward(&t5_input)?;

        let clip_tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let clip_input = Tensor::new(&*clip_tokens, &self.device)?.unsqueeze(0)?;
        let clip_emb = self.clip_model.forward(&clip_input)?;

        Ok((t5_emb, clip_emb))
    }

    fn run(&mut self, params: &GenerationParams) -> Result<DynamicImage> {
        let GenerationParams {
            prompt,
            width,
            height,
            steps,
            seed,
        } = params;
        let (width, height, steps) = (*width, *height, *steps);

        let noise = seeded_noise(*seed, height, width, &self.device)?.to_dtype(self.dtype)?;

        let (t5_emb, clip_emb) = self.text_embeddings(prompt)?;
        let state = sampling::State::new(&t5_emb, &clip_emb, &noise)?;
        let timesteps = match self.variant {
            FluxVariant::Schnell => sampling::get_schedule(steps, None),
            FluxVariant::Dev => sampling::get_schedule(steps, Some((state.img.dim(1)?, 0.5, 1.15))),
        };

        let started = Instant::now();
        let latent = sampling::denoise(
            &self.flux_model,
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            &timesteps,
            self.variant.guidance(),
        )?;
        let latent = sampling::unpack(&latent, height, width)?;
        tracing::debug!(
            steps,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "denoised latent image"
        );

        let decoded = self.autoencoder.decode(&latent)?;
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }
}

impl Engine for FluxEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(&mut self, params: &GenerationParams) -> Result<DynamicImage, GenerationError> {
        params.validate()?;
        if params.width % SIZE_MULTIPLE != 0 || params.height % SIZE_MULTIPLE != 0 {
            return Err(GenerationError::InvalidParams(format!(
                "image size must be a multiple of {SIZE_MULTIPLE}, got {}x{}",
                params.width, params.height
            )));
        }
        Ok(self.run(params)?)
    }
}

fn mmaped_var_builder(
    file: std::path::PathBuf,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    // SAFETY: weight files are opened read-only and are not modified while mapped.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[file], dtype, device)? };
    Ok(vb)
}

pub struct FluxLoader;

impl FluxLoader {
    async fn load_weights(
        variant: FluxVariant,
        api: Api,
        device: Device,
        dtype: DType,
    ) -> Result<FluxEngine> {
        // --- T5 encoder ---
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let t5_model_file = t5_repo
            .get("model.safetensors")
            .await
            .context("failed to get T5 model file")?;
        let t5_vb = mmaped_var_builder(t5_model_file, dtype, &device)
            .context("failed to build T5 var builder")?;
        let config_filename = t5_repo
            .get("config.json")
            .await
            .context("failed to get T5 config")?;
        let config_str =
            std::fs::read_to_string(&config_filename).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer_filename = api
            .model("lmz/mt5-tokenizers".to_string())
            .get("t5-v1_1-xxl.tokenizer.json")
            .await
            .context("failed to get T5 tokenizer")?;
        let t5_tokenizer = Tokenizer::from_file(t5_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;
        tracing::info!("loaded T5 encoder");

        // --- CLIP encoder ---
        let clip_repo = api.repo(hf_hub::Repo::model(
            "openai/clip-vit-large-patch14".to_string(),
        ));
        let clip_model_file = clip_repo
            .get("model.safetensors")
            .await
            .context("failed to get CLIP model file")?;
        let clip_vb = mmaped_var_builder(clip_model_file, dtype, &device)
            .context("failed to build CLIP var builder")?;
        let clip_config = ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer_filename = clip_repo
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let clip_tokenizer = Tokenizer::from_file(clip_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        tracing::info!("loaded CLIP encoder");

        // --- Autoencoder and transformer ---
        let bf_repo = api.repo(hf_hub::Repo::model(variant.repo().to_string()));
        let autoencoder_file = bf_repo
            .get("ae.safetensors")
            .await
            .context("failed to get autoencoder model file")?;
        let autoencoder_vb = mmaped_var_builder(autoencoder_file, dtype, &device)
            .context("failed to build autoencoder var builder")?;
        let autoencoder_config = match variant {
            FluxVariant::Schnell => flux::autoencoder::Config::schnell(),
            FluxVariant::Dev => flux::autoencoder::Config::dev(),
        };
        let autoencoder = AutoEncoder::new(&autoencoder_config, autoencoder_vb)
            .context("failed to load autoencoder")?;

        let flux_model_file = bf_repo
            .get(variant.weights_file())
            .await
            .context("failed to get flux model file")?;
        let flux_vb = mmaped_var_builder(flux_model_file, dtype, &device)
            .context("failed to build flux var builder")?;
        let flux_config = match variant {
            FluxVariant::Schnell => flux::model::Config::schnell(),
            FluxVariant::Dev => flux::model::Config::dev(),
        };
        let flux_model = Flux::new(&flux_config, flux_vb).context("failed to load flux model")?;
        tracing::info!("loaded flux transformer and autoencoder");

        Ok(FluxEngine {
            name: variant.repo().to_string(),
            variant,
            device,
            dtype,
            t5_model,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            flux_model,
        })
    }
}

impl Loader for FluxLoader {
    type Variant = FluxVariant;
    type Model = FluxEngine;

    async fn load(
        variant: FluxVariant,
        api: Api,
        device_map: DeviceMap,
        precision: Precision,
    ) -> Result<Self::Model, LoadError> {
        let device = select_best_device(device_map).map_err(LoadError::Device)?;
        let dtype = precision.dtype_for(&device);
        tracing::info!(model = variant.repo(), ?device, ?dtype, "loading flux model");

        Self::load_weights(variant, api, device, dtype)
            .await
            .map_err(|source| LoadError::Weights {
                model: variant.repo().to_string(),
                source,
            })
    }
}
