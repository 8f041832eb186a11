use crate::binning::compute_edges;
use crate::data::{by_chunk, chunk_views, is_oob_row, oob_to_nid, ColumnKind, Frame, Scratch, FRESH};
use crate::distribution::{Distribution, Family};
use crate::errors::GroveError;
use crate::histogram::DHistogram;
use crate::metric::{log_loss, multi_log_loss, root_mean_squared_error};
use crate::mr::CancelToken;
use crate::quantiles::{stratified_quantile, weighted_quantile};
use crate::sampler::Sampler;
use crate::score_build::{build_layer_histos, score_and_route, HistoParams, LayerHistos};
use crate::splitter::{sample_score_cols, split_layer, SplitFinder};
use crate::tree::{DTree, NO_PARENT};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;

const MIN_LOG_TRUNC: f64 = -19.0;
const MAX_LOG_TRUNC: f64 = 19.0;

/// Gradient boosting machine over a chunked frame.
///
/// * `distribution` - The loss family driving residuals and leaf fits.
/// * `ntrees` - Number of boosting rounds; each round adds one tree per
///   class.
/// * `max_depth` - Maximum depth of an individual tree.
/// * `learn_rate` - Step size applied to every leaf prediction.
/// * `learn_rate_annealing` - Multiplicative decay of the learning rate
///   per round; training stops early once the effective rate underflows.
/// * `nbins` - Histogram bins per feature below the root.
/// * `nbins_top_level` - Bin budget for the root layer (the larger of
///   this and `nbins` is used).
/// * `nbins_cats` - Bin cap for categorical features.
/// * `min_rows` - Minimum weight each child of a split must hold.
/// * `min_split_improvement` - Squared-error reduction a split must beat.
/// * `sample_rate` - Row sample rate per tree; dropped rows go
///   out-of-bag.
/// * `col_sample_rate` - Column sample rate per split.
/// * `col_sample_rate_per_tree` - Column sample rate drawn once per tree.
/// * `max_abs_leafnode_pred` - Cap on the magnitude of leaf predictions.
/// * `pred_noise_bandwidth` - Gaussian noise factor applied to leaf
///   predictions when folding them into the ensemble.
/// * `huber_alpha` - Quantile of absolute residuals that sets the huber
///   cutoff each round.
/// * `quantile_alpha` - Target quantile for the quantile distribution.
/// * `tweedie_power` - Tweedie variance power in (1, 2).
/// * `histo` - Engine knobs for the parallel histogram build.
#[derive(Serialize, Deserialize)]
pub struct Gbm {
    pub distribution: Family,
    pub ntrees: usize,
    pub max_depth: usize,
    pub learn_rate: f64,
    pub learn_rate_annealing: f64,
    pub nbins: usize,
    pub nbins_top_level: usize,
    pub nbins_cats: usize,
    pub min_rows: f64,
    pub min_split_improvement: f64,
    pub sample_rate: f64,
    pub sample_rate_per_class: Option<Vec<f64>>,
    pub col_sample_rate: f64,
    pub col_sample_rate_per_tree: f64,
    pub max_abs_leafnode_pred: f64,
    pub pred_noise_bandwidth: f64,
    pub huber_alpha: f64,
    pub quantile_alpha: f64,
    pub tweedie_power: f64,
    pub seed: u64,
    pub histo: HistoParams,
    /// Fitted state: one (possibly absent) tree per round per class.
    pub trees: Vec<Vec<Option<DTree>>>,
    pub init_f: f64,
    pub nclass: usize,
    /// Per-round training metric.
    pub scoring_history: Vec<f64>,
    /// Final link-space training predictions, one column per class.
    pub train_predictions: Vec<Vec<f64>>,
}

impl Default for Gbm {
    fn default() -> Self {
        Gbm::new(Family::Gaussian)
    }
}

impl Gbm {
    pub fn new(distribution: Family) -> Self {
        Gbm {
            distribution,
            ntrees: 50,
            max_depth: 5,
            learn_rate: 0.1,
            learn_rate_annealing: 1.0,
            nbins: 20,
            nbins_top_level: 1024,
            nbins_cats: 1024,
            min_rows: 10.0,
            min_split_improvement: 1e-5,
            sample_rate: 1.0,
            sample_rate_per_class: None,
            col_sample_rate: 1.0,
            col_sample_rate_per_tree: 1.0,
            max_abs_leafnode_pred: f64::MAX,
            pred_noise_bandwidth: 0.0,
            huber_alpha: 0.9,
            quantile_alpha: 0.5,
            tweedie_power: 1.5,
            seed: 0,
            histo: HistoParams::default(),
            trees: Vec::new(),
            init_f: 0.0,
            nclass: 1,
            scoring_history: Vec::new(),
            train_predictions: Vec::new(),
        }
    }

    pub fn set_ntrees(mut self, ntrees: usize) -> Self {
        self.ntrees = ntrees;
        self
    }

    pub fn set_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn set_learn_rate(mut self, learn_rate: f64) -> Self {
        self.learn_rate = learn_rate;
        self
    }

    pub fn set_nbins(mut self, nbins: usize) -> Self {
        self.nbins = nbins;
        self
    }

    pub fn set_min_rows(mut self, min_rows: f64) -> Self {
        self.min_rows = min_rows;
        self
    }

    pub fn set_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn effective_learning_rate(&self, round: usize) -> f64 {
        self.learn_rate * self.learn_rate_annealing.powi(round as i32)
    }

    fn validate(
        &self,
        frame: &Frame,
        y: &[f64],
        sample_weight: Option<&[f64]>,
        offset: Option<&[f64]>,
    ) -> Result<(), GroveError> {
        if self.ntrees == 0 {
            return Err(GroveError::invalid("ntrees", "must be at least 1"));
        }
        if !(0.0 < self.learn_rate && self.learn_rate <= 1.0) {
            return Err(GroveError::invalid("learn_rate", "must be between 0 and 1"));
        }
        if !(0.0 < self.learn_rate_annealing && self.learn_rate_annealing <= 1.0) {
            return Err(GroveError::invalid(
                "learn_rate_annealing",
                "must be between 0 and 1",
            ));
        }
        if self.nbins < 2 {
            return Err(GroveError::invalid("nbins", "must be at least 2"));
        }
        if self.nbins_cats < 2 {
            return Err(GroveError::invalid("nbins_cats", "must be at least 2"));
        }
        if self.min_rows <= 0.0 {
            return Err(GroveError::invalid("min_rows", "must be positive"));
        }
        if self.min_split_improvement < 0.0 {
            return Err(GroveError::invalid(
                "min_split_improvement",
                "must be non-negative",
            ));
        }
        if !(0.0 < self.sample_rate && self.sample_rate <= 1.0) {
            return Err(GroveError::invalid("sample_rate", "must be in (0, 1]"));
        }
        if let Some(rates) = &self.sample_rate_per_class {
            if rates.iter().any(|r| !(0.0 < *r && *r <= 1.0)) {
                return Err(GroveError::invalid(
                    "sample_rate_per_class",
                    "every rate must be in (0, 1]",
                ));
            }
        }
        if !(0.0 < self.col_sample_rate && self.col_sample_rate <= 1.0) {
            return Err(GroveError::invalid("col_sample_rate", "must be in (0, 1]"));
        }
        if !(0.0 < self.col_sample_rate_per_tree && self.col_sample_rate_per_tree <= 1.0) {
            return Err(GroveError::invalid(
                "col_sample_rate_per_tree",
                "must be in (0, 1]",
            ));
        }
        if self.max_abs_leafnode_pred <= 0.0 {
            return Err(GroveError::invalid(
                "max_abs_leafnode_pred",
                "must be larger than 0",
            ));
        }
        if self.pred_noise_bandwidth < 0.0 {
            return Err(GroveError::invalid("pred_noise_bandwidth", "must be >= 0"));
        }
        if !(0.0 < self.huber_alpha && self.huber_alpha < 1.0) {
            return Err(GroveError::invalid("huber_alpha", "must be in (0, 1)"));
        }
        if !(0.0 < self.quantile_alpha && self.quantile_alpha < 1.0) {
            return Err(GroveError::invalid("quantile_alpha", "must be in (0, 1)"));
        }
        if !(1.0 < self.tweedie_power && self.tweedie_power < 2.0) {
            return Err(GroveError::invalid("tweedie_power", "must be in (1, 2)"));
        }
        if y.len() != frame.nrows() {
            return Err(GroveError::invalid("y", "length must match the frame"));
        }
        if let Some(w) = sample_weight {
            if w.len() != frame.nrows() {
                return Err(GroveError::invalid("sample_weight", "length must match the frame"));
            }
        }
        if let Some(o) = offset {
            if o.len() != frame.nrows() {
                return Err(GroveError::invalid("offset", "length must match the frame"));
            }
            if self.distribution == Family::Multinomial {
                return Err(GroveError::invalid(
                    "offset",
                    "offset is not supported for the multinomial distribution",
                ));
            }
            if matches!(self.distribution, Family::Bernoulli | Family::ModifiedHuber)
                && o.iter().any(|v| *v > 1.0)
            {
                return Err(GroveError::invalid(
                    "offset",
                    "offset cannot be larger than 1 for this distribution",
                ));
            }
        }
        let valid = |v: &f64| !v.is_nan();
        match self.distribution {
            Family::Bernoulli | Family::ModifiedHuber => {
                if y.iter().filter(|v| valid(v)).any(|v| *v != 0.0 && *v != 1.0) {
                    return Err(GroveError::DistributionMismatch {
                        distribution: format!("{}", self.distribution),
                        expected: "2-class categorical",
                    });
                }
            }
            Family::Multinomial => {
                if y.iter()
                    .filter(|v| valid(v))
                    .any(|v| *v < 0.0 || v.fract() != 0.0)
                {
                    return Err(GroveError::DistributionMismatch {
                        distribution: format!("{}", self.distribution),
                        expected: "categorical",
                    });
                }
            }
            Family::Poisson | Family::Tweedie => {
                if y.iter().filter(|v| valid(v)).any(|v| *v < 0.0) {
                    return Err(GroveError::DistributionMismatch {
                        distribution: format!("{}", self.distribution),
                        expected: "non-negative numeric",
                    });
                }
            }
            Family::Gamma => {
                if y.iter().filter(|v| valid(v)).any(|v| *v <= 0.0) {
                    return Err(GroveError::DistributionMismatch {
                        distribution: format!("{}", self.distribution),
                        expected: "positive numeric",
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Fit the booster on a frame of features.
    ///
    /// * `frame` - The feature columns.
    /// * `y` - The response; class codes for classification families.
    /// * `sample_weight` - Optional per-row observation weights.
    /// * `offset` - Optional per-row offset added to the prediction in
    ///   link space.
    pub fn fit(
        &mut self,
        frame: &Frame,
        y: &[f64],
        sample_weight: Option<&[f64]>,
        offset: Option<&[f64]>,
    ) -> Result<(), GroveError> {
        self.validate(frame, y, sample_weight, offset)?;
        let mut dist = Distribution::new(self.distribution);
        dist.tweedie_power = self.tweedie_power;
        dist.quantile_alpha = self.quantile_alpha;

        let nrows = frame.nrows();
        let ncols = frame.ncols();
        self.nclass = if self.distribution == Family::Multinomial {
            y.iter()
                .filter(|v| !v.is_nan())
                .map(|v| *v as usize + 1)
                .max()
                .unwrap_or(1)
                .max(2)
        } else {
            1
        };
        let k_trees = self.nclass.max(1);
        let class_marginal = self.class_marginal(y, sample_weight, k_trees);

        self.init_f = self.initial_prediction(y, sample_weight, offset, &dist);
        if !self.init_f.is_finite() {
            self.init_f = 0.0;
        }
        let mut scratch = Scratch::new(k_trees, nrows);
        if self.init_f != 0.0 {
            for v in scratch.tree[0].iter_mut() {
                *v = self.init_f;
            }
        }

        let adj_nbins = self.nbins_top_level.max(self.nbins);
        let edges = compute_edges(frame, sample_weight, adj_nbins);
        let col_ranges: Vec<Option<(f64, f64)>> =
            (0..ncols).map(|c| frame.col_range(c)).collect();

        let mtry_per_tree = ((self.col_sample_rate_per_tree * ncols as f64) as usize).max(1);
        let mtry =
            ((self.col_sample_rate * self.col_sample_rate_per_tree * ncols as f64) as usize).max(1);
        let finder = SplitFinder {
            min_rows: self.min_rows,
            min_split_improvement: self.min_split_improvement,
        };
        let sampler = Sampler {
            sample_rate: self.sample_rate,
            sample_rate_per_class: self.sample_rate_per_class.clone(),
            seed: self.seed,
        };
        let mut rng = StdRng::seed_from_u64(self.seed);

        self.trees.clear();
        self.scoring_history.clear();

        for round in 0..self.ntrees {
            if self.effective_learning_rate(round) < 1e-6 {
                warn!(
                    "effective learning rate dropped below 1e-6 ({} * {}^{}), stopping the model",
                    self.learn_rate, self.learn_rate_annealing, round
                );
                break;
            }

            // Residuals for this round; huber first derives its cutoff
            // from the quantile of absolute residuals.
            if dist.needs_huber_fit() {
                let abs_diff = self.diff_column(&scratch, y, offset, true);
                let delta = weighted_quantile(&abs_diff, sample_weight, self.huber_alpha);
                dist.set_huber_delta(if delta.is_nan() { 1.0 } else { delta });
            }
            self.compute_residuals(frame, &mut scratch, y, sample_weight, offset, &dist, &class_marginal);

            let mut ktrees: Vec<Option<DTree>> = (0..k_trees).map(|_| None).collect();
            let mut layers: Vec<Option<LayerHistos>> = (0..k_trees).map(|_| None).collect();
            for k in 0..k_trees {
                if class_marginal[k] == 0.0 {
                    continue;
                }
                if k == 1 && self.nclass == 2 {
                    // Two-class multinomial only needs the first tree.
                    continue;
                }
                let cols_per_tree = if mtry_per_tree < ncols {
                    sample_score_cols(&None, ncols, mtry_per_tree, &mut rng)
                } else {
                    None
                };
                let mut tree = DTree::new(cols_per_tree);
                let root_cols = sample_score_cols(&tree.cols_per_tree, ncols, mtry, &mut rng);
                tree.push_undecided(NO_PARENT, root_cols.clone());
                let hists: Vec<Option<DHistogram>> = (0..ncols)
                    .map(|c| {
                        let tracked =
                            root_cols.as_ref().map_or(true, |s| s.binary_search(&c).is_ok());
                        tracked.then(|| match frame.column_kind(c) {
                            ColumnKind::Categorical => DHistogram::categorical(
                                c,
                                frame.col(c).cardinality(),
                                self.nbins_cats,
                            ),
                            ColumnKind::Numeric => match &edges[c] {
                                Some(e) => DHistogram::from_edges(c, e.clone()),
                                None => DHistogram::uniform(c, 1, f64::NAN, f64::NAN),
                            },
                        })
                    })
                    .collect();
                layers[k] = Some(LayerHistos::new(0, vec![hists]));
                ktrees[k] = Some(tree);
            }

            if self.sample_rate < 1.0 || self.sample_rate_per_class.is_some() {
                for k in 0..k_trees {
                    if ktrees[k].is_some() {
                        sampler.mark_oob(frame, &mut scratch.nids[k], y, round, k);
                    }
                }
            }

            // One histogram layer per depth across all class trees.
            for _depth in 0..self.max_depth {
                let mut any_split = false;
                for k in 0..k_trees {
                    let (Some(tree), Some(hcs)) = (ktrees[k].as_mut(), layers[k].take()) else {
                        continue;
                    };
                    if hcs.layer_len() == 0 {
                        layers[k] = Some(hcs);
                        continue;
                    }
                    let routes = score_and_route(
                        frame,
                        tree,
                        hcs.leaf_start,
                        hcs.layer_len(),
                        &mut scratch.nids[k],
                        y,
                        sample_weight,
                        self.histo.unordered,
                    );
                    let mut hcs = hcs;
                    let cancel = CancelToken::new();
                    build_layer_histos(
                        frame,
                        tree,
                        &mut hcs,
                        &routes,
                        &scratch.work[k],
                        sample_weight,
                        &self.histo,
                        &cancel,
                    )?;
                    let (next, did_split) = split_layer(
                        tree,
                        hcs,
                        &finder,
                        frame,
                        &col_ranges,
                        self.nbins,
                        self.nbins_cats,
                        mtry,
                        &mut rng,
                    );
                    if did_split {
                        any_split = true;
                    }
                    layers[k] = Some(next);
                }
                if !any_split {
                    break;
                }
            }

            // Remaining frontier nodes bottomed out; make them leaves.
            for tree in ktrees.iter_mut().flatten() {
                for nid in 0..tree.len() {
                    if matches!(tree.node(nid), crate::node::Node::Undecided(_)) {
                        tree.make_leaf(nid);
                    }
                }
            }

            // Leaf fit: route every row to its final leaf and compute the
            // per-leaf constants.
            let gammas = self.gamma_pass(frame, &mut scratch, y, sample_weight, offset, &dist, &ktrees);
            if dist.needs_quantile_fit() {
                let q = if self.distribution == Family::Laplace {
                    0.5
                } else {
                    self.quantile_alpha
                };
                self.fit_best_constants_quantile(&scratch, y, sample_weight, offset, &mut ktrees, q, round);
            } else if dist.needs_huber_fit() {
                self.fit_best_constants_huber(&scratch, y, sample_weight, offset, &mut ktrees, dist.huber_delta, round);
            } else {
                self.fit_best_constants(&mut ktrees, &gammas, &dist, round);
            }
            if dist.truncate_log_space() {
                self.truncate_preds(&scratch, y, sample_weight, offset, &mut ktrees, &dist);
            }

            // Fold the new trees into the running ensemble and reset the
            // node assignments for the next round.
            self.add_tree_contributions(&mut scratch, y, sample_weight, &ktrees, round);

            self.scoring_history.push(self.training_metric(&scratch, y, sample_weight, offset, &dist));
            self.trees.push(ktrees);
        }

        self.train_predictions = scratch.tree;
        info!(
            "trained {} rounds, final metric {:?}",
            self.trees.len(),
            self.scoring_history.last()
        );
        Ok(())
    }

    /// Weighted share of each class in the response; regression families
    /// get a single always-nonzero class.
    fn class_marginal(&self, y: &[f64], sample_weight: Option<&[f64]>, k_trees: usize) -> Vec<f64> {
        let mut marginal = vec![0.0; k_trees];
        if self.distribution != Family::Multinomial {
            marginal[0] = 1.0;
            return marginal;
        }
        for (i, &v) in y.iter().enumerate() {
            if v.is_nan() {
                continue;
            }
            let w = sample_weight.map_or(1.0, |w| w[i]);
            marginal[v as usize] += w;
        }
        marginal
    }

    fn initial_prediction(
        &self,
        y: &[f64],
        sample_weight: Option<&[f64]>,
        offset: Option<&[f64]>,
        dist: &Distribution,
    ) -> f64 {
        let diff: Vec<f64> = y
            .iter()
            .enumerate()
            .map(|(i, &v)| v - offset.map_or(0.0, |o| o[i]))
            .collect();
        match self.distribution {
            Family::Multinomial => 0.0,
            Family::Laplace | Family::Huber => weighted_quantile(&diff, sample_weight, 0.5),
            Family::Quantile => weighted_quantile(&diff, sample_weight, self.quantile_alpha),
            Family::Bernoulli if offset.is_some() => {
                self.initial_value_bernoulli_offset(y, sample_weight, offset.unwrap_or(&[]), dist)
            }
            _ => {
                let mut num = 0.0;
                let mut den = 0.0;
                for (i, &v) in y.iter().enumerate() {
                    if v.is_nan() {
                        continue;
                    }
                    let w = sample_weight.map_or(1.0, |w| w[i]);
                    num += w * diff[i];
                    den += w;
                }
                if den == 0.0 {
                    0.0
                } else {
                    dist.init_f_from_mean(num / den)
                }
            }
        }
    }

    /// One Newton-Raphson step for the self-consistent bernoulli initial
    /// value when an offset column shifts every row.
    fn initial_value_bernoulli_offset(
        &self,
        y: &[f64],
        sample_weight: Option<&[f64]>,
        offset: &[f64],
        dist: &Distribution,
    ) -> f64 {
        info!("running Newton-Raphson iteration for the initial value since offsets are specified");
        let init = 0.0;
        let mut num = 0.0;
        let mut denom = 0.0;
        for (i, &yv) in y.iter().enumerate() {
            if yv.is_nan() {
                continue;
            }
            let w = sample_weight.map_or(1.0, |w| w[i]);
            if w == 0.0 {
                continue;
            }
            let p = dist.link_inv(offset[i] + init);
            num += w * (yv - p);
            denom += w * p * (1.0 - p);
        }
        if denom == 0.0 {
            0.0
        } else {
            init + num / denom
        }
    }

    /// `y - (f + o)` per row (absolute value when `abs` is set); NaN for
    /// rows with a missing response.
    fn diff_column(&self, scratch: &Scratch, y: &[f64], offset: Option<&[f64]>, abs: bool) -> Vec<f64> {
        y.iter()
            .enumerate()
            .map(|(i, &yv)| {
                if yv.is_nan() {
                    return f64::NAN;
                }
                let f = scratch.tree[0][i] + offset.map_or(0.0, |o| o[i]);
                let d = yv - f;
                if abs {
                    d.abs()
                } else {
                    d
                }
            })
            .collect()
    }

    /// Write the negative half-gradient of every row into the work
    /// columns, chunk-parallel. Multinomial softmaxes the class trees
    /// with an overflow path for saturated logits.
    fn compute_residuals(
        &self,
        frame: &Frame,
        scratch: &mut Scratch,
        y: &[f64],
        sample_weight: Option<&[f64]>,
        offset: Option<&[f64]>,
        dist: &Distribution,
        class_marginal: &[f64],
    ) {
        let espc = frame.espc().to_vec();
        let Scratch { tree, work, .. } = scratch;
        let tree_cols: &Vec<Vec<f64>> = tree;
        let work_chunks = by_chunk(
            work.iter_mut()
                .map(|w| chunk_views(w, &espc))
                .collect::<Vec<_>>(),
        );
        let multinomial = self.distribution == Family::Multinomial;
        let nclass = self.nclass;

        work_chunks
            .into_par_iter()
            .enumerate()
            .for_each(|(cidx, mut wk)| {
                let base = espc[cidx];
                let len = wk[0].len();
                let mut fs = vec![0.0; nclass.max(1)];
                for row in 0..len {
                    let i = base + row;
                    let w = sample_weight.map_or(1.0, |w| w[i]);
                    if w == 0.0 || y[i].is_nan() {
                        continue;
                    }
                    if multinomial {
                        // Two-class trees store only the first class; the
                        // second is its mirror image.
                        for k in 0..nclass {
                            fs[k] = if nclass == 2 && k == 1 {
                                -tree_cols[0][i]
                            } else {
                                tree_cols[k][i]
                            };
                        }
                        if fs.iter().any(|f| *f == f64::INFINITY) {
                            for (k, wk_col) in wk.iter_mut().enumerate() {
                                let ind = if y[i] as usize == k { 1.0 } else { 0.0 };
                                let sat = if fs[k] == f64::INFINITY { 1.0 } else { 0.0 };
                                wk_col[row] = ind - sat;
                            }
                        } else {
                            let m = fs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                            let sum: f64 = fs.iter().map(|f| (f - m).exp()).sum();
                            for (k, wk_col) in wk.iter_mut().enumerate() {
                                if class_marginal[k] == 0.0 {
                                    continue;
                                }
                                let p = (fs[k] - m).exp() / sum;
                                let ind = if y[i] as usize == k { 1.0 } else { 0.0 };
                                wk_col[row] = ind - p;
                            }
                        }
                    } else {
                        let f = tree_cols[0][i] + offset.map_or(0.0, |o| o[i]);
                        wk[0][row] = dist.neg_half_gradient(y[i], f);
                    }
                }
            });
    }

    /// Closed-form leaf statistics: route every row (out-of-bag included)
    /// to its final leaf, record it in the nids column, and accumulate
    /// the distribution's num/denom for the in-bag rows.
    #[allow(clippy::too_many_arguments)]
    fn gamma_pass(
        &self,
        frame: &Frame,
        scratch: &mut Scratch,
        y: &[f64],
        sample_weight: Option<&[f64]>,
        offset: Option<&[f64]>,
        dist: &Distribution,
        ktrees: &[Option<DTree>],
    ) -> Vec<Vec<(f64, f64)>> {
        let espc = frame.espc().to_vec();
        let Scratch { tree, work, nids } = scratch;
        let tree_cols: &Vec<Vec<f64>> = tree;
        let work_cols: &Vec<Vec<f64>> = work;
        let skip_accumulate = dist.needs_quantile_fit() || dist.needs_huber_fit();

        let leaf_slots: Vec<Vec<usize>> = ktrees
            .iter()
            .map(|t| t.as_ref().map(|t| t.leaf_slots()).unwrap_or_default())
            .collect();
        let n_leaves: Vec<usize> = ktrees
            .iter()
            .map(|t| t.as_ref().map(|t| t.leaves().len()).unwrap_or(0))
            .collect();

        let nid_chunks = by_chunk(
            nids.iter_mut()
                .map(|n| chunk_views(n, &espc))
                .collect::<Vec<_>>(),
        );

        let partials: Vec<Vec<Vec<(f64, f64)>>> = nid_chunks
            .into_par_iter()
            .enumerate()
            .map(|(cidx, mut nk)| {
                let base = espc[cidx];
                let mut acc: Vec<Vec<(f64, f64)>> = n_leaves
                    .iter()
                    .map(|&n| vec![(0.0, 0.0); n])
                    .collect();
                for (k, nids_chunk) in nk.iter_mut().enumerate() {
                    let Some(tree) = ktrees[k].as_ref() else { continue };
                    // A trivial tree holds no decisions and no residual
                    // mass worth fitting.
                    let trivial = tree.is_trivial();
                    for (row, nid_slot) in nids_chunk.iter_mut().enumerate() {
                        let i = base + row;
                        let w = sample_weight.map_or(1.0, |w| w[i]);
                        if w == 0.0 || y[i].is_nan() {
                            continue;
                        }
                        let mut nid = *nid_slot;
                        let was_oob = is_oob_row(nid);
                        if was_oob {
                            nid = oob_to_nid(nid);
                        }
                        if nid < 0 {
                            continue;
                        }
                        let leafnid = tree
                            .final_leaf(nid as usize, |col| frame.col(col).data[i]);
                        *nid_slot = leafnid as i32;
                        if trivial || was_oob || skip_accumulate {
                            continue;
                        }
                        let z = work_cols[k][i];
                        let f = tree_cols[k][i] + offset.map_or(0.0, |o| o[i]);
                        let slot = leaf_slots[k][leafnid];
                        let (num, denom) = &mut acc[k][slot];
                        *num += dist.gamma_num(w, y[i], z, f);
                        *denom += dist.gamma_denom(w, y[i], z, f);
                    }
                }
                acc
            })
            .collect();

        let mut gammas: Vec<Vec<(f64, f64)>> =
            n_leaves.iter().map(|&n| vec![(0.0, 0.0); n]).collect();
        for partial in partials {
            for (k, leaves) in partial.into_iter().enumerate() {
                for (slot, (num, denom)) in leaves.into_iter().enumerate() {
                    gammas[k][slot].0 += num;
                    gammas[k][slot].1 += denom;
                }
            }
        }
        gammas
    }

    /// Closed-form leaf predictions from the accumulated num/denom.
    fn fit_best_constants(
        &self,
        ktrees: &mut [Option<DTree>],
        gammas: &[Vec<(f64, f64)>],
        dist: &Distribution,
        round: usize,
    ) {
        let multinomial = self.distribution == Family::Multinomial;
        let m1class = if multinomial {
            (self.nclass as f64 - 1.0) / self.nclass as f64
        } else {
            1.0
        };
        let eff_rate = self.effective_learning_rate(round);
        for (k, tree) in ktrees.iter_mut().enumerate() {
            let Some(tree) = tree.as_mut() else { continue };
            if tree.is_trivial() {
                continue;
            }
            for (slot, leaf) in tree.leaves().into_iter().enumerate() {
                let (num, denom) = gammas[k][slot];
                let gamma = if denom == 0.0 {
                    0.0
                } else if dist.truncate_log_space() {
                    dist.link(num / denom)
                } else {
                    num / denom
                };
                let mut gf = eff_rate * m1class * gamma;
                if multinomial {
                    gf = gf.clamp(-1e4, 1e4);
                }
                if gf.is_nan() {
                    gf = 0.0;
                } else if gf.is_infinite() {
                    gf = gf.signum() * 1e4;
                }
                gf = gf.clamp(-self.max_abs_leafnode_pred, self.max_abs_leafnode_pred);
                tree.set_leaf_pred(leaf, gf as f32);
            }
        }
    }

    /// Leaf-relative strata for the quantile passes: every row's final
    /// leaf slot, -1 for rows without one.
    fn leaf_strata(&self, scratch: &Scratch, slots: &[usize]) -> Vec<i32> {
        scratch.nids[0]
            .iter()
            .map(|&nid| {
                if nid < 0 || nid as usize >= slots.len() {
                    return -1;
                }
                let slot = slots[nid as usize];
                if slot == usize::MAX {
                    -1
                } else {
                    slot as i32
                }
            })
            .collect()
    }

    /// Laplace/quantile leaf fit: the stratified weighted quantile of
    /// `y - (f + o)` per leaf.
    #[allow(clippy::too_many_arguments)]
    fn fit_best_constants_quantile(
        &self,
        scratch: &Scratch,
        y: &[f64],
        sample_weight: Option<&[f64]>,
        offset: Option<&[f64]>,
        ktrees: &mut [Option<DTree>],
        q: f64,
        round: usize,
    ) {
        let Some(tree) = ktrees[0].as_mut() else { return };
        if tree.is_trivial() {
            return;
        }
        let slots = tree.leaf_slots();
        let leaves = tree.leaves();
        let diff = self.diff_column(scratch, y, offset, false);
        let strata = self.leaf_strata(scratch, &slots);
        let quantiles = stratified_quantile(&diff, sample_weight, &strata, leaves.len(), q);
        let eff_rate = self.effective_learning_rate(round);
        for (slot, &leaf) in leaves.iter().enumerate() {
            let qv = quantiles[slot];
            if qv.is_nan() {
                continue;
            }
            let val = (eff_rate * qv).clamp(-self.max_abs_leafnode_pred, self.max_abs_leafnode_pred);
            tree.set_leaf_pred(leaf, val as f32);
        }
    }

    /// Huber two-step leaf fit: per-leaf median of the residual, then a
    /// clamped mean correction around it.
    #[allow(clippy::too_many_arguments)]
    fn fit_best_constants_huber(
        &self,
        scratch: &Scratch,
        y: &[f64],
        sample_weight: Option<&[f64]>,
        offset: Option<&[f64]>,
        ktrees: &mut [Option<DTree>],
        huber_delta: f64,
        round: usize,
    ) {
        let Some(tree) = ktrees[0].as_mut() else { return };
        if tree.is_trivial() {
            return;
        }
        let slots = tree.leaf_slots();
        let leaves = tree.leaves();
        let diff = self.diff_column(scratch, y, offset, false);
        let strata = self.leaf_strata(scratch, &slots);
        let medians = stratified_quantile(&diff, sample_weight, &strata, leaves.len(), 0.5);

        let mut gamma_num = vec![0.0; leaves.len()];
        let mut wcounts = vec![0.0; leaves.len()];
        for (i, &s) in strata.iter().enumerate() {
            if s < 0 {
                continue;
            }
            let d = diff[i];
            if d.is_nan() {
                continue;
            }
            let w = sample_weight.map_or(1.0, |w| w[i]);
            let r = d - medians[s as usize];
            gamma_num[s as usize] += w * r.signum() * r.abs().min(huber_delta);
            wcounts[s as usize] += w;
        }

        let eff_rate = self.effective_learning_rate(round);
        for (slot, &leaf) in leaves.iter().enumerate() {
            if medians[slot].is_nan() || wcounts[slot] == 0.0 {
                continue;
            }
            let huber = medians[slot] + gamma_num[slot] / wcounts[slot];
            let val =
                (eff_rate * huber).clamp(-self.max_abs_leafnode_pred, self.max_abs_leafnode_pred);
            tree.set_leaf_pred(leaf, val as f32);
        }
    }

    /// Keep log-space leaf predictions inside the exp-safe range, shifted
    /// by each leaf's observed prediction range.
    fn truncate_preds(
        &self,
        scratch: &Scratch,
        y: &[f64],
        sample_weight: Option<&[f64]>,
        offset: Option<&[f64]>,
        ktrees: &mut [Option<DTree>],
        dist: &Distribution,
    ) {
        let Some(tree) = ktrees[0].as_mut() else { return };
        if tree.is_trivial() {
            return;
        }
        let slots = tree.leaf_slots();
        let leaves = tree.leaves();
        let mut mins = vec![f64::INFINITY; leaves.len()];
        let mut maxs = vec![f64::NEG_INFINITY; leaves.len()];
        for (i, &nid) in scratch.nids[0].iter().enumerate() {
            if nid < 0 || y[i].is_nan() {
                continue;
            }
            if sample_weight.map_or(1.0, |w| w[i]) == 0.0 {
                continue;
            }
            let slot = slots[nid as usize];
            if slot == usize::MAX {
                continue;
            }
            let f = scratch.tree[0][i] + offset.map_or(0.0, |o| o[i]);
            mins[slot] = mins[slot].min(f);
            maxs[slot] = maxs[slot].max(f);
        }
        // Gamma and tweedie shift the overflow check by the leaf's range
        // of current predictions; the clamped value always backs off by
        // the range so the cumulative sum stays exp-safe.
        let shifted = matches!(dist.family, Family::Gamma | Family::Tweedie);
        for (slot, &leaf) in leaves.iter().enumerate() {
            if !mins[slot].is_finite() {
                continue;
            }
            let mut pred = tree.leaf_pred(leaf) as f64;
            let val = pred + if shifted { maxs[slot] } else { 0.0 };
            if val > MAX_LOG_TRUNC {
                pred = MAX_LOG_TRUNC - maxs[slot];
            }
            let val = pred + if shifted { mins[slot] } else { 0.0 };
            if val < MIN_LOG_TRUNC {
                pred = MIN_LOG_TRUNC - mins[slot];
            }
            tree.set_leaf_pred(leaf, pred as f32);
        }
    }

    /// Fold each tree's leaf predictions into the running ensemble sum
    /// and reset the node assignments to FRESH. Written values are
    /// truncated to f32 so replays reconstruct bit-identical columns.
    fn add_tree_contributions(
        &self,
        scratch: &mut Scratch,
        y: &[f64],
        sample_weight: Option<&[f64]>,
        ktrees: &[Option<DTree>],
        round: usize,
    ) {
        let nclass = scratch.nclass();
        let Scratch { tree, nids, .. } = scratch;
        for k in 0..nclass {
            let Some(ktree) = ktrees[k].as_ref() else {
                // No tree for this class this round; still reset nids.
                for nid in nids[k].iter_mut() {
                    *nid = FRESH;
                }
                continue;
            };
            let baseseed = (0xDECAF_u64.wrapping_add(self.seed)).wrapping_mul(
                0xFAAA_AAAB_u64
                    .wrapping_add((k * self.ntrees + round) as u64),
            );
            let bandwidth = self.pred_noise_bandwidth;
            let tree_col = &mut tree[k];
            let nids_col = &mut nids[k];
            tree_col
                .par_iter_mut()
                .zip(nids_col.par_iter_mut())
                .enumerate()
                .for_each(|(i, (t, nid_slot))| {
                    let nid = *nid_slot;
                    *nid_slot = FRESH;
                    if nid < 0 {
                        return;
                    }
                    if y[i].is_nan() {
                        return;
                    }
                    if sample_weight.map_or(1.0, |w| w[i]) == 0.0 {
                        return;
                    }
                    let mut factor = 1.0;
                    if bandwidth != 0.0 {
                        let mut rng = StdRng::seed_from_u64(baseseed.wrapping_add(nid as u64));
                        let g: f64 = rng.sample(StandardNormal);
                        factor += g * bandwidth;
                    }
                    let pred = ktree.leaf_pred(nid as usize) as f64;
                    *t = (*t + factor * pred) as f32 as f64;
                });
        }
    }

    /// Per-round training metric: log loss for the binary classifiers,
    /// multinomial log loss for multiclass, RMSE on the mean scale
    /// otherwise.
    fn training_metric(
        &self,
        scratch: &Scratch,
        y: &[f64],
        sample_weight: Option<&[f64]>,
        offset: Option<&[f64]>,
        dist: &Distribution,
    ) -> f64 {
        let nrows = y.len();
        let ones = vec![1.0; nrows];
        let w = sample_weight.unwrap_or(&ones);
        match self.distribution {
            Family::Bernoulli | Family::ModifiedHuber => {
                let f: Vec<f64> = (0..nrows)
                    .map(|i| scratch.tree[0][i] + offset.map_or(0.0, |o| o[i]))
                    .collect();
                log_loss(y, &f, w)
            }
            Family::Multinomial => {
                let p_true: Vec<f64> = (0..nrows)
                    .map(|i| {
                        if y[i].is_nan() {
                            return 1.0;
                        }
                        let fs: Vec<f64> = (0..self.nclass)
                            .map(|k| {
                                if self.nclass == 2 && k == 1 {
                                    -scratch.tree[0][i]
                                } else {
                                    scratch.tree[k][i]
                                }
                            })
                            .collect();
                        let m = fs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                        let sum: f64 = fs.iter().map(|f| (f - m).exp()).sum();
                        (fs[y[i] as usize] - m).exp() / sum
                    })
                    .collect();
                multi_log_loss(&p_true, w)
            }
            _ => {
                let preds: Vec<f64> = (0..nrows)
                    .map(|i| dist.link_inv(scratch.tree[0][i] + offset.map_or(0.0, |o| o[i])))
                    .collect();
                root_mean_squared_error(y, &preds, w)
            }
        }
    }

    /// Save the fitted booster as json.
    pub fn save_model(&self, path: &str) -> Result<(), GroveError> {
        let model = self.json_dump()?;
        fs::write(path, model).map_err(|e| GroveError::UnableToWrite(e.to_string()))
    }

    pub fn json_dump(&self) -> Result<String, GroveError> {
        serde_json::to_string(self).map_err(|e| GroveError::UnableToWrite(e.to_string()))
    }

    pub fn from_json(json_str: &str) -> Result<Self, GroveError> {
        serde_json::from_str::<Gbm>(json_str).map_err(|e| GroveError::UnableToRead(e.to_string()))
    }

    pub fn load_model(path: &str) -> Result<Self, GroveError> {
        let json_str = fs::read_to_string(path).map_err(|e| GroveError::UnableToRead(e.to_string()))?;
        Self::from_json(&json_str)
    }
}
