use std::collections::VecDeque;

/// Naive weighted percentiles calculation, missing values must
/// be filtered out before calling.
///
/// * `v` - The values to find percentiles for.
/// * `sample_weight` - Sample weights for the instances of the vector.
/// * `percentiles` - Percentiles to look for in the data. This should be
///   values from 0 to 1, and in sorted order.
pub fn percentiles(v: &[f64], sample_weight: &[f64], percentiles: &[f64]) -> Vec<f64> {
    let mut idx: Vec<usize> = (0..v.len()).collect();
    idx.sort_unstable_by(|a, b| v[*a].partial_cmp(&v[*b]).unwrap());

    let mut pcts = VecDeque::from_iter(percentiles.iter());
    let mut current_pct = *pcts.pop_front().expect("No percentiles were provided");

    let mut p = Vec::new();
    let mut cuml_pct = 0.0;
    let mut current_value = v[idx[0]];
    let total_weight = sample_weight.iter().sum::<f64>();

    for i in idx.iter() {
        if current_value != v[*i] {
            current_value = v[*i];
        }
        cuml_pct += sample_weight[*i] / total_weight;
        if (current_pct == 0.0) || (cuml_pct >= current_pct) {
            // The same number might be a valid value for several
            // percentiles in a row.
            while cuml_pct >= current_pct {
                p.push(current_value);
                match pcts.pop_front() {
                    Some(p_) => current_pct = *p_,
                    None => return p,
                }
            }
        } else if current_pct == 1.0 {
            if let Some(i_) = idx.last() {
                p.push(v[*i_]);
                break;
            }
        }
    }
    p
}

/// Return the index of the first value in a sorted slice that is
/// greater than another number. NaN always lands on index zero.
pub fn first_greater_than(x: &[f64], v: f64) -> usize {
    let mut low = 0;
    let mut high = x.len();
    while low != high {
        let mid = (low + high) / 2;
        // Always false for NaN, which forces NaN to the bottom.
        if x[mid] <= v {
            low = mid + 1;
        } else {
            high = mid;
        }
    }
    low
}

/// Round to a set number of decimal digits, for float comparisons
/// in tests.
pub fn precision_round(n: f64, digits: i32) -> f64 {
    let scale = 10.0_f64.powi(digits);
    (n * scale).round() / scale
}

/// The next representable float above `v`, used to build exclusive
/// upper bounds for histogram ranges.
pub fn next_up(v: f64) -> f64 {
    if v.is_nan() || v == f64::INFINITY {
        return v;
    }
    if v == 0.0 {
        return f64::from_bits(1);
    }
    if v > 0.0 {
        f64::from_bits(v.to_bits() + 1)
    } else {
        f64::from_bits(v.to_bits() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn test_percentiles() {
        let v = vec![4., 5., 6., 1., 2., 3., 7., 8., 9., 10.];
        let w = vec![1.; v.len()];
        let p = vec![0.3, 0.5, 0.75, 1.0];
        let p = percentiles(&v, &w, &p);
        assert_eq!(p, vec![3.0, 5.0, 8.0, 10.0]);
    }

    #[test]
    fn test_percentiles_weighted() {
        let v = vec![10., 8., 9., 1., 2., 3., 6., 7., 4., 5.];
        let w = vec![1., 1., 1., 1., 1., 2., 1., 1., 5., 1.];
        let p = vec![0.3, 0.5, 0.75, 1.0];
        let p = percentiles(&v, &w, &p);
        assert_eq!(p, vec![4.0, 4.0, 7.0, 10.0]);
    }

    #[test]
    fn test_first_greater_than() {
        let v = vec![f64::MIN, 1., 4., 8., 9.];
        assert_eq!(1, first_greater_than(&v, 0.));
        assert_eq!(2, first_greater_than(&v, 1.));
        assert_eq!(2, first_greater_than(&v, 2.));
        assert_eq!(3, first_greater_than(&v, 4.));
        assert_eq!(5, first_greater_than(&v, 9.));
        assert_eq!(5, first_greater_than(&v, 10.));
        assert_eq!(0, first_greater_than(&v, f64::NAN));
    }

    #[test]
    fn test_next_up() {
        assert!(next_up(0.0) > 0.0);
        assert!(next_up(1.0) > 1.0);
        assert!(next_up(-1.0) > -1.0);
        assert_eq!(next_up(f64::INFINITY), f64::INFINITY);
    }
}
