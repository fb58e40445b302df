use repr_similarity_backend_core::{Representation, Shape, SimilarityFunction, SimilarityRequest};

#[derive(Debug)]
pub struct Score(pub f32);

impl Score {
    fn is_close(&self, other: &Self, abs_tol: f32) -> bool {
        is_close::default()
            .abs_tol(abs_tol)
            .is_close(self.0, other.0)
    }
}

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        // Default tolerance for equality
        self.is_close(other, 1e-5)
    }
}

pub fn scores(values: &[f32]) -> Vec<Score> {
    values.iter().copied().map(Score).collect()
}

/// Build a representation whose cell `(step, i, j)` holds `f(step, i, j, k)` for `k in 0..m`
pub fn representation(shape: Shape, f: impl Fn(usize, usize, usize, usize) -> f32) -> Representation {
    let mut values = Vec::with_capacity(shape.len().unwrap_or_default());
    for step in 0..shape.steps {
        for i in 0..shape.n {
            for j in 0..shape.n {
                for k in 0..shape.m {
                    values.push(f(step, i, j, k));
                }
            }
        }
    }
    Representation::new(values)
}

pub fn request(func: SimilarityFunction, shape: Shape) -> SimilarityRequest {
    SimilarityRequest {
        func,
        repr1: "http://x/a.bin".to_string(),
        repr2: "http://x/b.bin".to_string(),
        step1: 0,
        step2: 0,
        row: 0,
        col: 0,
        shape: Some(shape),
    }
}
