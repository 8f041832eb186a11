use crate::data::{ColumnKind, Frame};
use crate::utils::{next_up, percentiles};
use std::sync::Arc;

/// Weighted-percentile cut edges for every numeric column, used to build
/// the root-layer histograms. Categorical columns bin by level and get
/// None here; so do all-missing columns.
pub fn compute_edges(
    frame: &Frame,
    sample_weight: Option<&[f64]>,
    nbins: usize,
) -> Vec<Option<Arc<Vec<f64>>>> {
    (0..frame.ncols())
        .map(|c| {
            if frame.column_kind(c) == ColumnKind::Categorical {
                return None;
            }
            column_edges(frame.col(c).data.as_slice(), sample_weight, nbins).map(Arc::new)
        })
        .collect()
}

fn column_edges(col: &[f64], sample_weight: Option<&[f64]>, nbins: usize) -> Option<Vec<f64>> {
    let mut values = Vec::with_capacity(col.len());
    let mut weights = Vec::with_capacity(col.len());
    for (i, &v) in col.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        values.push(v);
        weights.push(sample_weight.map_or(1.0, |w| w[i]));
    }
    if values.is_empty() {
        return None;
    }
    let nbins = nbins.max(1);
    let pcts: Vec<f64> = (0..=nbins).map(|i| i as f64 / nbins as f64).collect();
    let mut edges = percentiles(&values, &weights, &pcts);
    edges.dedup();
    if edges.len() < 2 {
        // Constant column: one unsplittable bin.
        let v = edges.first().copied().unwrap_or(0.0);
        return Some(vec![v, next_up(v)]);
    }
    // The top edge is exclusive; nudge it so the max value bins.
    let n = edges.len();
    edges[n - 1] = next_up(edges[n - 1]);
    Some(edges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Column;

    #[test]
    fn test_edges_are_monotone_and_cover() {
        let data: Vec<f64> = (0..100).map(|i| (i as f64) * 0.37).collect();
        let edges = column_edges(&data, None, 10).unwrap();
        assert!(edges.len() >= 2);
        assert!(edges.windows(2).all(|w| w[0] < w[1]));
        assert!(edges[0] <= 0.0);
        assert!(*edges.last().unwrap() > 99.0 * 0.37);
    }

    #[test]
    fn test_constant_column_gets_one_bin() {
        let data = vec![5.0; 20];
        let edges = column_edges(&data, None, 10).unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0], 5.0);
        assert!(edges[1] > 5.0);
    }

    #[test]
    fn test_all_missing_column_has_no_edges() {
        let data = vec![f64::NAN; 10];
        assert!(column_edges(&data, None, 10).is_none());
    }

    #[test]
    fn test_categorical_columns_are_skipped() {
        let num = Column::numeric("n", vec![1., 2., 3., 4.]);
        let cat = Column::categorical(
            "c",
            vec![0., 1., 0., 1.],
            vec!["a".to_string(), "b".to_string()],
        );
        let frame = Frame::new(vec![num, cat], 2).unwrap();
        let edges = compute_edges(&frame, None, 4);
        assert!(edges[0].is_some());
        assert!(edges[1].is_none());
    }

    #[test]
    fn test_weighted_edges_follow_the_mass() {
        let data = vec![0., 1., 2., 3., 4., 5., 6., 7., 8., 9.];
        let w = vec![100., 1., 1., 1., 1., 1., 1., 1., 1., 1.];
        let edges = column_edges(&data, Some(&w), 2).unwrap();
        // Half the weight sits on zero, so the middle edge stays low.
        assert!(edges[1] <= 1.0);
    }
}
