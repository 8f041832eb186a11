/// Weighted log loss for binary families; `yhat` is in link space.
pub fn log_loss(y: &[f64], yhat: &[f64], sample_weight: &[f64]) -> f64 {
    y.iter()
        .zip(yhat)
        .zip(sample_weight)
        .map(|((y_, yhat_), w_)| {
            let p = 1.0 / (1.0 + (-*yhat_).exp());
            let p = p.clamp(1e-15, 1.0 - 1e-15);
            -(*y_ * p.ln() + (1.0 - *y_) * (1.0 - p).ln()) * *w_
        })
        .sum::<f64>()
}

/// Weighted RMSE for the regression families.
pub fn root_mean_squared_error(y: &[f64], yhat: &[f64], sample_weight: &[f64]) -> f64 {
    let mut w_sum = 0.;
    let res = y
        .iter()
        .zip(yhat)
        .zip(sample_weight)
        .map(|((y_, yhat_), w_)| {
            w_sum += *w_;
            (y_ - yhat_).powi(2) * *w_
        })
        .sum::<f64>();
    (res / w_sum).sqrt()
}

/// Weighted multinomial log loss from the probability assigned to each
/// row's true class.
pub fn multi_log_loss(p_true: &[f64], sample_weight: &[f64]) -> f64 {
    p_true
        .iter()
        .zip(sample_weight)
        .map(|(p, w)| -p.clamp(1e-15, 1.0).ln() * *w)
        .sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::precision_round;

    #[test]
    fn test_log_loss_prefers_better_fit() {
        let y = vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let w = vec![1.; y.len()];
        let good = vec![-1.0, -1.0, -1.0, 1.0, 1.0, 1.0];
        let bad = vec![0.0, 0.0, -1.0, 1.0, 0.0, 1.0];
        assert!(log_loss(&y, &good, &w) < log_loss(&y, &bad, &w));
    }

    #[test]
    fn test_root_mean_squared_error() {
        let y = vec![1., 3., 4., 5., 2., 4., 6.];
        let yhat = vec![3., 2., 3., 4., 4., 4., 4.];
        let sample_weight = vec![1., 1., 1., 1., 1., 2., 2.];
        let res = root_mean_squared_error(&y, &yhat, &sample_weight);
        assert_eq!(precision_round(res, 6), 1.452966);
    }

    #[test]
    fn test_multi_log_loss_is_zero_for_certainty() {
        let p = vec![1.0, 1.0];
        let w = vec![1.0, 1.0];
        assert_eq!(multi_log_loss(&p, &w), 0.0);
        let p = vec![0.5, 0.5];
        assert!(multi_log_loss(&p, &w) > 0.0);
    }
}
