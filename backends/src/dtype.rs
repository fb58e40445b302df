use half::f16;
use std::fmt;

#[cfg(feature = "clap")]
use clap::ValueEnum;

/// Precision representations are kept at once decoded
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
#[cfg_attr(feature = "clap", derive(ValueEnum))]
pub enum DType {
    /// Round every value through IEEE half precision
    #[default]
    Float16,
    /// Keep the decoded `f32` values as-is
    Float32,
}

impl DType {
    pub(crate) fn round(&self, value: f32) -> f32 {
        match self {
            DType::Float16 => f16::from_f32(value).to_f32(),
            DType::Float32 => value,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DType::Float16 => write!(f, "float16"),
            DType::Float32 => write!(f, "float32"),
        }
    }
}
