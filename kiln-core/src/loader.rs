use std::future::Future;

use hf_hub::api::tokio::Api;

use crate::{DeviceMap, Engine, LoadError, Precision};

/// Brings a model family up on a device. Called once at startup, before any
/// generation is accepted.
pub trait Loader {
    type Variant;
    type Model: Engine;

    fn load(
        variant: Self::Variant,
        api: Api,
        device_map: DeviceMap,
        precision: Precision,
    ) -> impl Future<Output = Result<Self::Model, LoadError>>
    where
        Self: Sized;
}
