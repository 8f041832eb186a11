/// Weighted quantile of `values` with linear interpolation between the
/// adjacent weighted order statistics. NaN values are skipped; returns
/// NaN when nothing remains.
pub fn weighted_quantile(values: &[f64], weights: Option<&[f64]>, q: f64) -> f64 {
    let mut pairs: Vec<(f64, f64)> = values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .map(|(i, &v)| (v, weights.map_or(1.0, |w| w[i])))
        .filter(|&(_, w)| w > 0.0)
        .collect();
    if pairs.is_empty() {
        return f64::NAN;
    }
    pairs.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
    let total: f64 = pairs.iter().map(|p| p.1).sum();
    let target = q * total;

    let mut cuml = 0.0;
    for (i, &(v, w)) in pairs.iter().enumerate() {
        let next = cuml + w;
        if next >= target {
            // A boundary hit means the quantile sits between two order
            // statistics; interpolate halfway.
            if next == target && i + 1 < pairs.len() {
                return (v + pairs[i + 1].0) / 2.0;
            }
            return v;
        }
        cuml = next;
    }
    pairs[pairs.len() - 1].0
}

/// Per-stratum weighted quantile: `strata[i]` assigns row i to a stratum
/// (negative = skip). Returns one quantile per stratum id in
/// [0, nstrata); strata with no rows yield NaN.
pub fn stratified_quantile(
    values: &[f64],
    weights: Option<&[f64]>,
    strata: &[i32],
    nstrata: usize,
    q: f64,
) -> Vec<f64> {
    let mut grouped: Vec<Vec<(f64, f64)>> = vec![Vec::new(); nstrata];
    for (i, &s) in strata.iter().enumerate() {
        if s < 0 || s as usize >= nstrata {
            continue;
        }
        let v = values[i];
        if v.is_nan() {
            continue;
        }
        let w = weights.map_or(1.0, |w| w[i]);
        if w > 0.0 {
            grouped[s as usize].push((v, w));
        }
    }
    grouped
        .into_iter()
        .map(|mut pairs| {
            if pairs.is_empty() {
                return f64::NAN;
            }
            pairs.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
            let total: f64 = pairs.iter().map(|p| p.1).sum();
            let target = q * total;
            let mut cuml = 0.0;
            for (i, &(v, w)) in pairs.iter().enumerate() {
                let next = cuml + w;
                if next >= target {
                    if next == target && i + 1 < pairs.len() {
                        return (v + pairs[i + 1].0) / 2.0;
                    }
                    return v;
                }
                cuml = next;
            }
            pairs[pairs.len() - 1].0
        })
        .collect()
}
