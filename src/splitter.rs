use crate::data::{ColumnKind, Frame};
use crate::histogram::DHistogram;
use crate::node::{NaDirection, Split, SplitPredicate};
use crate::score_build::LayerHistos;
use crate::tree::DTree;
use crate::utils::next_up;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Sums of one candidate arm during the bin sweep.
#[derive(Debug, Clone, Copy, Default)]
struct Arm {
    w: f64,
    wy: f64,
    wyy: f64,
}

impl Arm {
    fn plus(&self, other: &Arm) -> Arm {
        Arm {
            w: self.w + other.w,
            wy: self.wy + other.wy,
            wyy: self.wyy + other.wyy,
        }
    }

    /// Squared error of the arm around its own mean.
    fn se(&self) -> f64 {
        if self.w > 0.0 {
            (self.wyy - self.wy * self.wy / self.w).max(0.0)
        } else {
            0.0
        }
    }
}

#[derive(Debug)]
struct Candidate {
    improvement: f64,
    #[allow(dead_code)]
    bin: usize,
    predicate: SplitPredicate,
    na_dir: NaDirection,
}

/// Searches one node's histograms for the squared-error-optimal split.
pub struct SplitFinder {
    pub min_rows: f64,
    pub min_split_improvement: f64,
}

impl SplitFinder {
    /// Best split across all tracked features, or None when no feature
    /// clears the improvement and weight constraints.
    pub fn best_split(&self, hists: &[Option<DHistogram>]) -> Option<Split> {
        let mut best: Option<(f64, usize, Candidate)> = None;
        for (col, hist) in hists.iter().enumerate() {
            let Some(h) = hist.as_ref() else { continue };
            if let Some(cand) = self.best_feature_split(h) {
                // Strict comparison keeps the lower column on ties.
                let better = match &best {
                    None => true,
                    Some((imp, _, _)) => cand.improvement > *imp,
                };
                if better {
                    best = Some((cand.improvement, col, cand));
                }
            }
        }
        best.map(|(_, col, cand)| Split {
            col,
            predicate: cand.predicate,
            na_dir: cand.na_dir,
            improvement: cand.improvement,
        })
    }

    /// Sweep one histogram's bins left to right, accumulating prefix sums
    /// and scoring every boundary with the missing mass joined to either
    /// arm, plus the missing-versus-rest candidate.
    fn best_feature_split(&self, h: &DHistogram) -> Option<Candidate> {
        let nb = h.nbins();
        let mut total = Arm::default();
        for b in 0..nb {
            total = total.plus(&Arm {
                w: h.w(b),
                wy: h.wy(b),
                wyy: h.wyy(b),
            });
        }
        let na = Arm {
            w: h.na_w(),
            wy: h.na_wy(),
            wyy: h.na_wyy(),
        };
        let all = total.plus(&na);
        if all.w == 0.0 {
            return None;
        }
        let se_parent = all.se();

        // Observed minima from bin b to the end, for threshold midpoints.
        let mut suffix_min = vec![f64::INFINITY; nb + 1];
        for b in (0..nb).rev() {
            suffix_min[b] = if h.bin_count(b) > 0 {
                suffix_min[b + 1].min(h.bin_min(b))
            } else {
                suffix_min[b + 1]
            };
        }

        let mut best: Option<Candidate> = None;
        let mut left = Arm::default();
        let mut prefix_max = f64::NEG_INFINITY;
        for b in 1..nb {
            let prev = b - 1;
            left = left.plus(&Arm {
                w: h.w(prev),
                wy: h.wy(prev),
                wyy: h.wyy(prev),
            });
            if h.bin_count(prev) > 0 {
                prefix_max = prefix_max.max(h.bin_max(prev));
            }
            let right = Arm {
                w: total.w - left.w,
                wy: total.wy - left.wy,
                wyy: total.wyy - left.wyy,
            };
            if left.w == 0.0 || right.w == 0.0 {
                continue;
            }

            // Join the missing mass to each arm in turn; without missing
            // rows both collapse to the same candidate and go left.
            let (na_dir, l_arm, r_arm) = if na.w == 0.0 {
                (NaDirection::Left, left, right)
            } else {
                let gain_left = se_parent - left.plus(&na).se() - right.se();
                let gain_right = se_parent - left.se() - right.plus(&na).se();
                if gain_right > gain_left {
                    (NaDirection::Right, left, right.plus(&na))
                } else {
                    (NaDirection::Left, left.plus(&na), right)
                }
            };
            if l_arm.w < self.min_rows || r_arm.w < self.min_rows {
                continue;
            }
            let improvement = se_parent - l_arm.se() - r_arm.se();
            if improvement.is_nan() || improvement <= self.min_split_improvement {
                continue;
            }
            let better = best.as_ref().map_or(true, |c| improvement > c.improvement);
            if better {
                let predicate = self.predicate_at(h, b, prefix_max, suffix_min[b]);
                best = Some(Candidate {
                    improvement,
                    bin: b,
                    predicate,
                    na_dir,
                });
            }
        }

        // Categorical equal mode: one level against the rest.
        if h.is_categorical() && h.level_step() == 1 {
            for b in 0..nb {
                let bin_arm = Arm {
                    w: h.w(b),
                    wy: h.wy(b),
                    wyy: h.wyy(b),
                };
                if bin_arm.w == 0.0 {
                    continue;
                }
                let rest = Arm {
                    w: total.w - bin_arm.w,
                    wy: total.wy - bin_arm.wy,
                    wyy: total.wyy - bin_arm.wyy,
                };
                let (na_dir, l_arm, r_arm) = if na.w == 0.0 {
                    (NaDirection::Left, bin_arm, rest)
                } else {
                    let gain_left = se_parent - bin_arm.plus(&na).se() - rest.se();
                    let gain_right = se_parent - bin_arm.se() - rest.plus(&na).se();
                    if gain_right > gain_left {
                        (NaDirection::Right, bin_arm, rest.plus(&na))
                    } else {
                        (NaDirection::Left, bin_arm.plus(&na), rest)
                    }
                };
                if l_arm.w < self.min_rows || r_arm.w < self.min_rows {
                    continue;
                }
                let improvement = se_parent - l_arm.se() - r_arm.se();
                if improvement.is_nan() || improvement <= self.min_split_improvement {
                    continue;
                }
                let better = best.as_ref().map_or(true, |c| improvement > c.improvement);
                if better {
                    best = Some(Candidate {
                        improvement,
                        bin: b,
                        predicate: SplitPredicate::Equal(b),
                        na_dir,
                    });
                }
            }
        }

        // Missing against the rest: every NA row forms the left arm.
        if na.w >= self.min_rows && total.w >= self.min_rows && na.w > 0.0 {
            let improvement = se_parent - na.se() - total.se();
            let better = best.as_ref().map_or(true, |c| improvement > c.improvement);
            if !improvement.is_nan() && improvement > self.min_split_improvement && better {
                best = Some(Candidate {
                    improvement,
                    bin: 0,
                    predicate: SplitPredicate::Threshold(f64::NEG_INFINITY),
                    na_dir: NaDirection::VsRest,
                });
            }
        }
        best
    }

    /// Materialize the predicate for a boundary before bin `b`: numeric
    /// splits use the midpoint between the arms' observed values,
    /// categorical ones a level bitset.
    fn predicate_at(
        &self,
        h: &DHistogram,
        b: usize,
        prefix_max: f64,
        suffix_min: f64,
    ) -> SplitPredicate {
        if h.is_categorical() {
            let step = h.level_step();
            let card = match h.spec() {
                crate::histogram::BinSpec::Levels { cardinality, .. } => *cardinality,
                _ => 0,
            };
            let set: Vec<bool> = (0..card).map(|lvl| lvl / step < b).collect();
            SplitPredicate::Bitset(set)
        } else if prefix_max.is_finite() && suffix_min.is_finite() {
            SplitPredicate::Threshold((prefix_max + suffix_min) / 2.0)
        } else {
            SplitPredicate::Threshold(suffix_min)
        }
    }
}

/// Build a child's histogram for one column, tightening the bin range to
/// what the parent actually observed (clipped by the threshold on the
/// split column itself).
fn child_histogram(
    frame: &Frame,
    col: usize,
    nbins: usize,
    nbins_cats: usize,
    parent: Option<&DHistogram>,
    col_ranges: &[Option<(f64, f64)>],
    split: &Split,
    left_side: bool,
) -> DHistogram {
    if frame.column_kind(col) == ColumnKind::Categorical {
        return DHistogram::categorical(col, frame.col(col).cardinality(), nbins_cats);
    }
    let range = parent
        .and_then(|p| p.observed_range())
        .or(col_ranges[col]);
    let Some((mut lo, mut hi)) = range else {
        return DHistogram::uniform(col, 1, f64::NAN, f64::NAN);
    };
    if col == split.col {
        if let SplitPredicate::Threshold(t) = split.predicate {
            if split.na_dir != NaDirection::VsRest {
                if left_side {
                    hi = hi.min(t);
                } else {
                    lo = lo.max(t);
                }
            }
        }
    }
    if left_side && col == split.col {
        // Left arm values are strictly below the threshold.
        DHistogram::uniform(col, nbins, lo, hi)
    } else {
        DHistogram::uniform(col, nbins, lo, next_up(hi))
    }
}

/// Draw a node's per-split column subset from the tree's eligible
/// columns; None when every eligible column is scored.
pub fn sample_score_cols(
    cols_per_tree: &Option<Vec<usize>>,
    ncols: usize,
    mtry: usize,
    rng: &mut StdRng,
) -> Option<Vec<usize>> {
    let eligible: Vec<usize> = match cols_per_tree {
        Some(cols) => cols.clone(),
        None => (0..ncols).collect(),
    };
    if mtry >= eligible.len() {
        return cols_per_tree.clone();
    }
    let mut chosen: Vec<usize> = eligible
        .choose_multiple(rng, mtry)
        .copied()
        .collect();
    chosen.sort_unstable();
    Some(chosen)
}

/// Split every undecided node of the current layer, consuming its
/// histograms. Returns the next layer's histograms and whether any split
/// was made; nodes that cannot split become leaves with prediction 0.
#[allow(clippy::too_many_arguments)]
pub fn split_layer(
    tree: &mut DTree,
    hcs: LayerHistos,
    finder: &SplitFinder,
    frame: &Frame,
    col_ranges: &[Option<(f64, f64)>],
    nbins: usize,
    nbins_cats: usize,
    mtry: usize,
    rng: &mut StdRng,
) -> (LayerHistos, bool) {
    let leaf_start = hcs.leaf_start;
    let next_start = tree.len();
    let mut next_by_node: Vec<Vec<Option<DHistogram>>> = Vec::new();
    let mut did_split = false;

    for (n, hists) in hcs.by_node.iter().enumerate() {
        let nid = leaf_start + n;
        match finder.best_split(hists) {
            None => tree.make_leaf(nid),
            Some(split) => {
                did_split = true;
                let ncols = frame.ncols();
                let left_cols = sample_score_cols(&tree.cols_per_tree, ncols, mtry, rng);
                let right_cols = sample_score_cols(&tree.cols_per_tree, ncols, mtry, rng);
                let mut left_hists: Vec<Option<DHistogram>> = Vec::with_capacity(ncols);
                let mut right_hists: Vec<Option<DHistogram>> = Vec::with_capacity(ncols);
                for c in 0..ncols {
                    let tracked_left = left_cols.as_ref().map_or(true, |s| s.binary_search(&c).is_ok());
                    let tracked_right =
                        right_cols.as_ref().map_or(true, |s| s.binary_search(&c).is_ok());
                    left_hists.push(tracked_left.then(|| {
                        child_histogram(
                            frame, c, nbins, nbins_cats, hists[c].as_ref(), col_ranges, &split, true,
                        )
                    }));
                    right_hists.push(tracked_right.then(|| {
                        child_histogram(
                            frame, c, nbins, nbins_cats, hists[c].as_ref(), col_ranges, &split, false,
                        )
                    }));
                }
                tree.decide(nid, split, left_cols, right_cols);
                next_by_node.push(left_hists);
                next_by_node.push(right_hists);
            }
        }
    }
    (LayerHistos::new(next_start, next_by_node), did_split)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_hist(values: &[(f64, f64)]) -> DHistogram {
        // (value, response) pairs, unit weight.
        let mut h = DHistogram::uniform(0, 4, 0.0, 4.0);
        for &(v, y) in values {
            h.update_row(1.0, v, y);
        }
        h
    }

    #[test]
    fn test_perfect_split_is_found() {
        let finder = SplitFinder {
            min_rows: 1.0,
            min_split_improvement: 0.0,
        };
        // Values below 2 respond -1, above 2 respond +1.
        let h = filled_hist(&[
            (0.5, -1.0),
            (1.5, -1.0),
            (0.7, -1.0),
            (2.5, 1.0),
            (3.5, 1.0),
            (3.1, 1.0),
        ]);
        let cand = finder.best_feature_split(&h).unwrap();
        assert_eq!(cand.bin, 2);
        assert_eq!(cand.na_dir, NaDirection::Left);
        match cand.predicate {
            SplitPredicate::Threshold(t) => assert!(t > 1.5 && t < 2.5),
            _ => panic!("expected threshold"),
        }
        assert!(cand.improvement > 5.9 && cand.improvement <= 6.0);
    }

    #[test]
    fn test_constant_response_does_not_split() {
        let finder = SplitFinder {
            min_rows: 1.0,
            min_split_improvement: 1e-9,
        };
        let h = filled_hist(&[(0.5, 2.0), (1.5, 2.0), (2.5, 2.0), (3.5, 2.0)]);
        assert!(finder.best_feature_split(&h).is_none());
    }

    #[test]
    fn test_min_rows_blocks_tiny_arms() {
        let finder = SplitFinder {
            min_rows: 3.0,
            min_split_improvement: 0.0,
        };
        // The only useful boundary leaves one row alone.
        let h = filled_hist(&[(0.5, -5.0), (2.5, 1.0), (3.5, 1.1), (3.7, 0.9)]);
        assert!(finder.best_feature_split(&h).is_none());
    }

    #[test]
    fn test_all_na_column_is_never_selected() {
        let finder = SplitFinder {
            min_rows: 1.0,
            min_split_improvement: 0.0,
        };
        let mut h = DHistogram::uniform(0, 4, 0.0, 4.0);
        for y in [1.0, -1.0, 2.0, -2.0] {
            h.update_row(1.0, f64::NAN, y);
        }
        assert!(finder.best_feature_split(&h).is_none());
    }

    #[test]
    fn test_na_mass_picks_a_direction() {
        let finder = SplitFinder {
            min_rows: 1.0,
            min_split_improvement: 0.0,
        };
        // Missing rows respond like the high arm, so they should go right.
        let mut h = filled_hist(&[(0.5, -1.0), (1.5, -1.0), (2.5, 1.0), (3.5, 1.0)]);
        h.update_row(1.0, f64::NAN, 1.0);
        h.update_row(1.0, f64::NAN, 1.1);
        let cand = finder.best_feature_split(&h).unwrap();
        assert_eq!(cand.na_dir, NaDirection::Right);
    }

    #[test]
    fn test_na_vs_rest_wins_when_na_is_its_own_cluster() {
        let finder = SplitFinder {
            min_rows: 1.0,
            min_split_improvement: 0.0,
        };
        // Observed rows are all alike; the missing rows carry the signal.
        let mut h = filled_hist(&[(0.5, 0.0), (1.5, 0.0), (2.5, 0.0), (3.5, 0.0)]);
        h.update_row(1.0, f64::NAN, 10.0);
        h.update_row(1.0, f64::NAN, 10.0);
        let cand = finder.best_feature_split(&h).unwrap();
        assert_eq!(cand.na_dir, NaDirection::VsRest);
    }

    #[test]
    fn test_categorical_equal_mode() {
        let finder = SplitFinder {
            min_rows: 1.0,
            min_split_improvement: 0.0,
        };
        let mut h = DHistogram::categorical(0, 3, 16);
        // Level 1 is the odd one out; levels 0 and 2 agree, so the
        // one-vs-rest candidate beats any ordered boundary.
        for &(lvl, y) in &[(0.0, 1.0), (0.0, 1.0), (1.0, -3.0), (1.0, -3.0), (2.0, 1.0), (2.0, 1.0)] {
            h.update_row(1.0, lvl, y);
        }
        let cand = finder.best_feature_split(&h).unwrap();
        match cand.predicate {
            SplitPredicate::Equal(l) => assert_eq!(l, 1),
            ref p => panic!("expected equal mode, got {:?}", p),
        }
    }
}
