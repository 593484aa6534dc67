use std::time::Duration;

use clap::Parser;
use kiln_core::{DeviceMap, DispatcherConfig, Precision};

use crate::{schemas::ImageSize, state::GenerationDefaults};

// Every flag can also be set from a `KILN_*` environment variable or `.env`.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Kiln image generation server")]
pub struct Args {
    /// Use CPU instead of GPU, overriding --device
    #[arg(long, env = "KILN_CPU")]
    pub cpu: bool,

    /// Compute device: `cpu`, `cuda`, `cuda:N` or `metal:N`
    #[arg(long, env = "KILN_DEVICE", default_value = "cuda:0")]
    pub device: DeviceMap,

    /// Weight precision: bf16, f16 or f32
    #[arg(long, env = "KILN_PRECISION", default_value = "bf16")]
    pub precision: Precision,

    /// Model variant to use
    #[arg(long, env = "KILN_MODEL", default_value = "black-forest-labs/FLUX.1-schnell")]
    pub model: String,

    /// Host address to bind the server to
    #[arg(long, env = "KILN_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to bind the server to
    #[arg(long, env = "KILN_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Image size used when a request has no `size`
    #[arg(long, env = "KILN_SIZE", default_value = "1024x1024")]
    pub size: ImageSize,

    /// Denoising steps used when a request has no `steps`
    #[arg(long, env = "KILN_STEPS", default_value_t = 4)]
    pub steps: usize,

    /// Seed used when a request has no `seed`
    #[arg(long, env = "KILN_SEED", default_value_t = 42)]
    pub seed: u64,

    /// Largest width or height a request may ask for
    #[arg(long, env = "KILN_MAX_SIZE", default_value_t = 2048)]
    pub max_size: usize,

    /// Most denoising steps a request may ask for
    #[arg(long, env = "KILN_MAX_STEPS", default_value_t = 50)]
    pub max_steps: usize,

    /// Reject requests with 503 once this many jobs are waiting (unbounded if unset)
    #[arg(long, env = "KILN_MAX_QUEUED")]
    pub max_queued: Option<usize>,

    /// Give up waiting for a generation after this many seconds
    #[arg(long, env = "KILN_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,

    /// How long shutdown waits for the in-flight generation
    #[arg(long, env = "KILN_SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    pub shutdown_grace_secs: u64,
}

impl Args {
    pub fn device_map(&self) -> DeviceMap {
        if self.cpu {
            DeviceMap::ForceCpu
        } else {
            self.device
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn defaults(&self) -> GenerationDefaults {
        GenerationDefaults {
            size: self.size,
            steps: self.steps,
            seed: self.seed,
            max_size: self.max_size,
            max_steps: self.max_steps,
            request_timeout: self.request_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_queued: self.max_queued,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults() {
        let args = Args::try_parse_from(["kiln-server"]).unwrap();
        assert_eq!(args.device_map(), DeviceMap::Ordinal(0));
        assert_eq!(args.precision, Precision::Bf16);
        assert_eq!(args.bind_address(), "127.0.0.1:8000");
        assert_eq!(args.defaults().size.to_string(), "1024x1024");
        assert_eq!(args.dispatcher_config().max_queued, None);
        assert_eq!(args.defaults().max_size, 2048);
        assert_eq!(args.defaults().max_steps, 50);
    }

    #[test]
    fn cpu_flag_overrides_device() {
        let args = Args::try_parse_from([
            "kiln-server",
            "--cpu",
            "--device",
            "cuda:1",
            "--size",
            "512x768",
            "--max-queued",
            "8",
            "--request-timeout-secs",
            "60",
            "--max-steps",
            "8",
        ])
        .unwrap();
        assert_eq!(args.device_map(), DeviceMap::ForceCpu);
        assert_eq!(args.defaults().size.height, 768);
        assert_eq!(args.defaults().request_timeout, Some(Duration::from_secs(60)));
        assert_eq!(args.dispatcher_config().max_queued, Some(8));
        assert_eq!(args.defaults().max_steps, 8);
    }

    #[test]
    fn rejects_malformed_size() {
        assert!(Args::try_parse_from(["kiln-server", "--size", "big"]).is_err());
    }
}
