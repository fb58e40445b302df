#[cfg(feature = "clap")]
use clap::ValueEnum;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of steps stored in a representation when the caller does not say otherwise
pub const DEFAULT_STEPS: usize = 4;

/// Flat `f32` buffer as decoded from the fetched bytes
#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    pub values: Vec<f32>,
    /// Shape the representation was validated against when it was fetched
    pub shape: Option<Shape>,
}

impl Representation {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            shape: None,
        }
    }

    pub fn with_shape(mut self, shape: Option<Shape>) -> Self {
        self.shape = shape;
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Layout of a representation: `steps` grids of `n x n` cells, each cell a vector of `m` values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub steps: usize,
    pub n: usize,
    pub m: usize,
}

impl Shape {
    pub fn new(steps: usize, n: usize, m: usize) -> Self {
        Self { steps, n, m }
    }

    /// Total number of values a representation with this shape holds, `None` on overflow
    pub fn len(&self) -> Option<usize> {
        self.steps
            .checked_mul(self.n)?
            .checked_mul(self.n)?
            .checked_mul(self.m)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    /// When set, the fetched representation must hold exactly as many values as `shape` describes
    pub shape: Option<Shape>,
}

#[derive(Debug, Clone)]
pub struct SimilarityRequest {
    pub func: SimilarityFunction,
    /// Key (URL) of the representation the base vector is taken from
    pub repr1: String,
    /// Key (URL) of the representation every grid cell is compared against
    pub repr2: String,
    pub step1: usize,
    pub step2: usize,
    pub row: usize,
    pub col: usize,
    /// Falls back to the shape `repr1` was fetched with
    pub shape: Option<Shape>,
}

/// Outcome of a comparison that did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    /// One value per cell of the `n x n` grid, column-major
    Similarities(Vec<f32>),
    /// At least one of the representations has not been fetched yet
    Loading,
}

pub trait Backend {
    fn health(&self) -> Result<(), BackendError>;

    fn contains(&self, key: &str) -> bool;

    fn insert(&mut self, key: String, repr: Representation);

    /// Remember that fetching `key` failed. A representation already stored under `key` wins.
    fn mark_failed(&mut self, key: String, reason: String);

    fn calc_similarities(&self, request: &SimilarityRequest) -> Result<Comparison, BackendError>;
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "clap", derive(ValueEnum))]
pub enum SimilarityFunction {
    /// Cosine similarity between the two vectors
    Cosine,
    /// Euclidean distance, normalized to `1 - d / max(d)` over the grid
    Euclidean,
    /// Manhattan distance, normalized to `1 - d / max(d)` over the grid
    Manhattan,
    /// Chebyshev distance, normalized to `1 - d / max(d)` over the grid
    Chebyshev,
}

impl SimilarityFunction {
    /// Distances grow with dissimilarity and are normalized after the whole grid is computed
    pub fn is_distance(&self) -> bool {
        !matches!(self, SimilarityFunction::Cosine)
    }
}

impl fmt::Display for SimilarityFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SimilarityFunction::Cosine => write!(f, "cosine"),
            SimilarityFunction::Euclidean => write!(f, "euclidean"),
            SimilarityFunction::Manhattan => write!(f, "manhattan"),
            SimilarityFunction::Chebyshev => write!(f, "chebyshev"),
        }
    }
}

impl FromStr for SimilarityFunction {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(SimilarityFunction::Cosine),
            "euclidean" => Ok(SimilarityFunction::Euclidean),
            "manhattan" => Ok(SimilarityFunction::Manhattan),
            "chebyshev" => Ok(SimilarityFunction::Chebyshev),
            _ => Err(BackendError::Inference(format!(
                "Unknown similarity function: {s}. Valid values: cosine, euclidean, manhattan, chebyshev"
            ))),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    #[error("Could not start backend: {0}")]
    Start(String),
    #[error("Could not fetch representation: {0}")]
    Fetch(String),
    #[error("{0}")]
    Inference(String),
    #[error("Backend is unavailable: {0}")]
    Unavailable(String),
}
