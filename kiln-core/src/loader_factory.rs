use hf_hub::api::tokio::Api;

use crate::{flux, DeviceMap, Engine, FluxLoader, LoadError, Loader, Precision};

/// Enum of supported model variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    Flux(flux::FluxVariant),
}

impl ModelVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("FLUX") {
            Some(ModelVariant::Flux(if name_upper.contains("DEV") {
                flux::FluxVariant::Dev
            } else {
                flux::FluxVariant::Schnell
            }))
        } else {
            None
        }
    }
}

/// Load a model based on its name, automatically detecting the appropriate loader
pub async fn load_engine(
    model_name: &str,
    api: Api,
    device_map: DeviceMap,
    precision: Precision,
) -> Result<Box<dyn Engine>, LoadError> {
    let variant = ModelVariant::from_name(model_name)
        .ok_or_else(|| LoadError::UnsupportedModel(model_name.to_string()))?;

    tracing::info!(
        model = model_name,
        ?variant,
        %device_map,
        %precision,
        "loading model"
    );

    match variant {
        ModelVariant::Flux(variant) => {
            let model = FluxLoader::load(variant, api, device_map, precision).await?;
            Ok(Box::new(model))
        }
    }
}
