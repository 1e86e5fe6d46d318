use nalgebra::DVector;

/// Per-entry fit weights from a fit residual.
///
/// `w_i = beta + (1 - beta) / (1 + alpha * e_i² / σ²)` with `σ²` the mean
/// squared residual. Weights lie in `[beta, 1]`; entries that the current
/// active set explains badly (large `|e_i|`) lose influence on the next fit.
/// A zero residual yields uniform weights.
pub(crate) fn residual_weights(residual: &DVector<f64>, alpha: f64, beta: f64) -> DVector<f64> {
    let n = residual.len().max(1) as f64;
    let sigma_sq = residual.norm_squared() / n;
    if sigma_sq <= f64::MIN_POSITIVE || alpha <= 0.0 {
        return DVector::from_element(residual.len(), 1.0);
    }
    let beta = beta.clamp(0.0, 1.0);
    residual.map(|e| beta + (1.0 - beta) / (1.0 + alpha * e * e / sigma_sq))
}
