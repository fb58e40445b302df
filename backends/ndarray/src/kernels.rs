use ndarray::ArrayView1;
use repr_similarity_backend_core::SimilarityFunction;

pub(crate) fn similarity(func: SimilarityFunction, a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    match func {
        SimilarityFunction::Cosine => cosine_similarity(a, b),
        SimilarityFunction::Euclidean => euclidean_distance(a, b),
        SimilarityFunction::Manhattan => manhattan_distance(a, b),
        SimilarityFunction::Chebyshev => chebyshev_distance(a, b),
    }
}

pub(crate) fn cosine_similarity(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    let norm_a = a.dot(&a).sqrt();
    let norm_b = b.dot(&b).sqrt();
    let den = norm_a * norm_b;
    if den == 0.0 {
        return 0.0;
    }
    a.dot(&b) / den
}

pub(crate) fn euclidean_distance(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    (&a - &b).mapv(|x| x.powi(2)).sum().sqrt()
}

pub(crate) fn manhattan_distance(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    (&a - &b).mapv(f32::abs).sum()
}

pub(crate) fn chebyshev_distance(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    (&a - &b).mapv(f32::abs).fold(0.0, |max, &v| v.max(max))
}

/// Map distances to `1 - d / max(d)` so that the closest cell scores highest
pub(crate) fn normalize_distances(distances: &mut [f32]) {
    let max_distance = distances.iter().copied().fold(0.0_f32, f32::max);
    if max_distance == 0.0 {
        distances.iter_mut().for_each(|d| *d = 1.0);
        return;
    }
    for distance in distances.iter_mut() {
        *distance = 1.0 - (*distance / max_distance);
    }
}
