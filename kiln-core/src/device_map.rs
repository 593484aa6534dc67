use std::{fmt, str::FromStr};

use candle_core::{DType, Device};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl FromStr for DeviceMap {
    type Err = String;

    /// Accepts `cpu`, `cuda`, `metal`, `cuda:N`, `metal:N` or a bare ordinal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s == "cpu" {
            return Ok(Self::ForceCpu);
        }
        let ordinal = match s.split_once(':') {
            Some(("cuda" | "metal" | "gpu", ordinal)) => ordinal,
            Some(_) => return Err(format!("unknown device: {s}")),
            None if matches!(s.as_str(), "cuda" | "metal" | "gpu") => "0",
            None => s.as_str(),
        };
        ordinal
            .parse()
            .map(Self::Ordinal)
            .map_err(|_| format!("invalid device ordinal in {s:?}"))
    }
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForceCpu => write!(f, "cpu"),
            Self::Ordinal(ordinal) => write!(f, "gpu:{ordinal}"),
        }
    }
}

/// Floating point precision the weights are loaded in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Precision {
    #[default]
    Bf16,
    F16,
    F32,
}

impl Precision {
    /// Resolves the requested precision against what the device supports.
    /// Half precision on CPU falls back to f32.
    pub fn dtype_for(self, device: &Device) -> DType {
        match self {
            Self::Bf16 => device.bf16_default_to_f32(),
            Self::F16 if device.is_cpu() => DType::F32,
            Self::F16 => DType::F16,
            Self::F32 => DType::F32,
        }
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bf16" | "bfloat16" => Ok(Self::Bf16),
            "f16" | "fp16" | "float16" => Ok(Self::F16),
            "f32" | "fp32" | "float32" => Ok(Self::F32),
            other => Err(format!("unknown precision: {other}")),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bf16 => "bf16",
            Self::F16 => "f16",
            Self::F32 => "f32",
        };
        f.write_str(name)
    }
}
