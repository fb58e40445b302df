mod kernels;

use ndarray::{s, ArrayView4};
use repr_similarity_backend_core::{
    Backend, BackendError, Comparison, Representation, Shape, SimilarityRequest,
};
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug)]
enum Entry {
    Ready(Representation),
    Failed(String),
}

/// In-memory numeric module keyed by representation URL
#[derive(Debug, Default)]
pub struct NdarrayBackend {
    representations: HashMap<String, Entry>,
}

impl NdarrayBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &str) -> Result<Option<&Representation>, BackendError> {
        match self.representations.get(key) {
            None => Ok(None),
            Some(Entry::Ready(repr)) => Ok(Some(repr)),
            Some(Entry::Failed(reason)) => Err(BackendError::Inference(format!(
                "representation {key} failed to load: {reason}"
            ))),
        }
    }
}

impl Backend for NdarrayBackend {
    fn health(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn contains(&self, key: &str) -> bool {
        matches!(self.representations.get(key), Some(Entry::Ready(_)))
    }

    fn insert(&mut self, key: String, repr: Representation) {
        self.representations.insert(key, Entry::Ready(repr));
    }

    fn mark_failed(&mut self, key: String, reason: String) {
        if !self.contains(&key) {
            self.representations.insert(key, Entry::Failed(reason));
        }
    }

    fn calc_similarities(&self, request: &SimilarityRequest) -> Result<Comparison, BackendError> {
        let start = Instant::now();

        let (repr1, repr2) = match (self.get(&request.repr1)?, self.get(&request.repr2)?) {
            (Some(repr1), Some(repr2)) => (repr1, repr2),
            _ => return Ok(Comparison::Loading),
        };
        let lookup_time = start.elapsed();

        let shape = resolve_shape(request, repr1)?;
        let repr1 = view(&request.repr1, repr1, shape)?;
        let repr2 = view(&request.repr2, repr2, shape)?;
        check_bounds(request, shape)?;
        let reshape_time = start.elapsed() - lookup_time;

        let base = repr1.slice(s![request.step1, request.row, request.col, ..]);

        let n = shape.n;
        let mut similarities = Vec::with_capacity(n * n);
        for j in 0..n {
            for i in 0..n {
                let concept = repr2.slice(s![request.step2, i, j, ..]);
                similarities.push(kernels::similarity(request.func, base, concept));
            }
        }
        let similarity_time = start.elapsed() - lookup_time - reshape_time;

        if request.func.is_distance() {
            kernels::normalize_distances(&mut similarities);
        }

        tracing::debug!(
            "Total {:?}, lookup: {lookup_time:?}, reshaping: {reshape_time:?}, similarity calculation: {similarity_time:?}",
            start.elapsed()
        );

        Ok(Comparison::Similarities(similarities))
    }
}

fn view<'a>(
    key: &str,
    repr: &'a Representation,
    shape: Shape,
) -> Result<ArrayView4<'a, f32>, BackendError> {
    let expected = shape.len().ok_or_else(|| {
        BackendError::Inference(format!(
            "shape ({}, {n}, {n}, {}) is too large",
            shape.steps,
            shape.m,
            n = shape.n,
        ))
    })?;
    if repr.len() != expected {
        return Err(BackendError::Inference(format!(
            "representation {key} holds {} values but shape ({}, {n}, {n}, {}) needs {expected}",
            repr.len(),
            shape.steps,
            shape.m,
            n = shape.n,
        )));
    }
    ArrayView4::from_shape((shape.steps, shape.n, shape.n, shape.m), &repr.values).e()
}

fn resolve_shape(request: &SimilarityRequest, repr1: &Representation) -> Result<Shape, BackendError> {
    request.shape.or(repr1.shape).ok_or_else(|| {
        BackendError::Inference(format!(
            "`n` and `m` are required, {} was fetched without a shape",
            request.repr1
        ))
    })
}

fn check_bounds(request: &SimilarityRequest, shape: Shape) -> Result<(), BackendError> {
    let checks = [
        ("step1", request.step1, shape.steps),
        ("step2", request.step2, shape.steps),
        ("row", request.row, shape.n),
        ("col", request.col, shape.n),
    ];
    for (name, value, bound) in checks {
        if value >= bound {
            return Err(BackendError::Inference(format!(
                "`{name}` must be lower than {bound}, got {value}"
            )));
        }
    }
    Ok(())
}

pub trait WrapErr<O> {
    fn e(self) -> Result<O, BackendError>;
}

impl<O> WrapErr<O> for Result<O, ndarray::ShapeError> {
    fn e(self) -> Result<O, BackendError> {
        self.map_err(|e| BackendError::Inference(e.to_string()))
    }
}
