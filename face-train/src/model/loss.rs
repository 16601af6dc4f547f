use crate::common::*;

/// Mean cross-entropy with optional per-example weights.
///
/// `logits` has shape `[batch, classes]` and `targets` holds `i64` class indices.
pub fn weighted_cross_entropy(
    logits: &Tensor,
    targets: &Tensor,
    example_weights: Option<&Tensor>,
) -> Tensor {
    let nll = -logits
        .log_softmax(-1, Kind::Float)
        .gather(1, &targets.unsqueeze(1), false)
        .squeeze_dim(1);

    match example_weights {
        Some(weights) => (nll * weights).mean(Kind::Float),
        None => nll.mean(Kind::Float),
    }
}

/// `coef * sum(w^2)` over a weight tensor.
pub fn l2_penalty(weight: &Tensor, coef: f64) -> Tensor {
    weight.square().sum(Kind::Float) * coef
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn weighted_cross_entropy_test() {
        let logits = Tensor::of_slice(&[0.0f32, 0.0, 0.0, 0.0]).view([2, 2]);
        let targets = Tensor::of_slice(&[0i64, 1]);

        // uniform logits give ln(2) per example
        let loss = f64::from(&weighted_cross_entropy(&logits, &targets, None));
        assert_abs_diff_eq!(loss, 2f64.ln(), epsilon = 1e-6);

        let weights = Tensor::of_slice(&[1.0f32, 3.0]);
        let loss = f64::from(&weighted_cross_entropy(&logits, &targets, Some(&weights)));
        assert_abs_diff_eq!(loss, 2.0 * 2f64.ln(), epsilon = 1e-6);
    }

    #[test]
    fn l2_penalty_test() {
        let weight = Tensor::of_slice(&[1.0f32, -2.0, 2.0]);
        let penalty = f64::from(&l2_penalty(&weight, 0.5));
        assert_abs_diff_eq!(penalty, 4.5, epsilon = 1e-6);
    }
}
