use crate::utils::{first_greater_than, next_up};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A float cell that can be updated either exclusively (plain load/store
/// when a worker owns the histogram) or concurrently (compare-and-swap
/// adds when the histogram is shared between workers).
#[derive(Debug)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(v: f64) -> Self {
        AtomicF64(AtomicU64::new(v.to_bits()))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn add(&self, v: f64) {
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(cur) + v).to_bits();
            match self
                .0
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(c) => cur = c,
            }
        }
    }

    pub fn min(&self, v: f64) {
        let mut cur = self.0.load(Ordering::Relaxed);
        while v < f64::from_bits(cur) {
            match self
                .0
                .compare_exchange_weak(cur, v.to_bits(), Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(c) => cur = c,
            }
        }
    }

    pub fn max(&self, v: f64) {
        let mut cur = self.0.load(Ordering::Relaxed);
        while v > f64::from_bits(cur) {
            match self
                .0
                .compare_exchange_weak(cur, v.to_bits(), Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(c) => cur = c,
            }
        }
    }
}

impl Clone for AtomicF64 {
    fn clone(&self) -> Self {
        AtomicF64::new(self.get())
    }
}

/// How raw column values map onto bin indices.
#[derive(Debug, Clone)]
pub enum BinSpec {
    /// Monotone cut edges from the binning service; bin i covers
    /// [edges[i], edges[i+1]). Out-of-range values clamp to the edge bins.
    Edges(Arc<Vec<f64>>),
    /// Equal-width bins over [min, max_ex).
    Uniform { min: f64, max_ex: f64, step: f64 },
    /// One bin per categorical level, `step` levels folded together when
    /// the domain exceeds the bin cap.
    Levels { cardinality: usize, step: usize },
}

/// Per-(node, feature) accumulator: for every bin the weight, weighted
/// response, weighted squared response, row count and the observed value
/// range; plus one triple for rows whose feature value is missing.
#[derive(Debug)]
pub struct DHistogram {
    pub col: usize,
    nbins: usize,
    spec: BinSpec,
    w: Vec<AtomicF64>,
    wy: Vec<AtomicF64>,
    wyy: Vec<AtomicF64>,
    count: Vec<AtomicU64>,
    mins: Vec<AtomicF64>,
    maxs: Vec<AtomicF64>,
    w_na: AtomicF64,
    wy_na: AtomicF64,
    wyy_na: AtomicF64,
}

impl DHistogram {
    fn with_spec(col: usize, nbins: usize, spec: BinSpec) -> Self {
        let nbins = nbins.max(1);
        DHistogram {
            col,
            nbins,
            spec,
            w: (0..nbins).map(|_| AtomicF64::new(0.0)).collect(),
            wy: (0..nbins).map(|_| AtomicF64::new(0.0)).collect(),
            wyy: (0..nbins).map(|_| AtomicF64::new(0.0)).collect(),
            count: (0..nbins).map(|_| AtomicU64::new(0)).collect(),
            mins: (0..nbins).map(|_| AtomicF64::new(f64::INFINITY)).collect(),
            maxs: (0..nbins).map(|_| AtomicF64::new(f64::NEG_INFINITY)).collect(),
            w_na: AtomicF64::new(0.0),
            wy_na: AtomicF64::new(0.0),
            wyy_na: AtomicF64::new(0.0),
        }
    }

    /// Histogram over externally supplied cut edges (the root layer).
    pub fn from_edges(col: usize, edges: Arc<Vec<f64>>) -> Self {
        let nbins = edges.len().saturating_sub(1).max(1);
        DHistogram::with_spec(col, nbins, BinSpec::Edges(edges))
    }

    /// Equal-width histogram over a half-open value range (child layers,
    /// tightened to the rows that reached the node).
    pub fn uniform(col: usize, nbins: usize, min: f64, max_ex: f64) -> Self {
        if !(max_ex > min) || !min.is_finite() {
            // Constant or empty range: a single unsplittable bin.
            return DHistogram::with_spec(
                col,
                1,
                BinSpec::Uniform { min, max_ex: next_up(min), step: 0.0 },
            );
        }
        let nbins = nbins.max(1);
        let step = (max_ex - min) / nbins as f64;
        DHistogram::with_spec(col, nbins, BinSpec::Uniform { min, max_ex, step })
    }

    /// One-bin-per-level histogram for a categorical column, folding
    /// levels together when the domain exceeds `nbins_cats`.
    pub fn categorical(col: usize, cardinality: usize, nbins_cats: usize) -> Self {
        let cardinality = cardinality.max(1);
        let step = cardinality.div_ceil(nbins_cats.max(1));
        let nbins = cardinality.div_ceil(step);
        DHistogram::with_spec(col, nbins, BinSpec::Levels { cardinality, step })
    }

    /// A zeroed histogram with the same shape, for deep-cloned workers.
    pub fn fresh_copy(&self) -> Self {
        DHistogram::with_spec(self.col, self.nbins, self.spec.clone())
    }

    pub fn nbins(&self) -> usize {
        self.nbins
    }

    pub fn spec(&self) -> &BinSpec {
        &self.spec
    }

    pub fn is_categorical(&self) -> bool {
        matches!(self.spec, BinSpec::Levels { .. })
    }

    /// Number of source levels folded into one bin (1 for numeric).
    pub fn level_step(&self) -> usize {
        match self.spec {
            BinSpec::Levels { step, .. } => step,
            _ => 1,
        }
    }

    /// Map a raw value to its bin; None routes to the NA accumulators.
    pub fn bin(&self, v: f64) -> Option<usize> {
        if v.is_nan() {
            return None;
        }
        let b = match &self.spec {
            BinSpec::Edges(edges) => first_greater_than(edges, v).saturating_sub(1),
            BinSpec::Uniform { min, step, .. } => {
                if *step == 0.0 {
                    0
                } else if v < *min {
                    0
                } else {
                    ((v - min) / step) as usize
                }
            }
            BinSpec::Levels { step, .. } => {
                if v < 0.0 {
                    return None;
                }
                v as usize / step
            }
        };
        Some(b.min(self.nbins - 1))
    }

    /// Exclusive single-row update; requires ownership of the histogram.
    pub fn update_row(&mut self, w: f64, v: f64, y: f64) {
        match self.bin(v) {
            None => {
                self.w_na.set(self.w_na.get() + w);
                self.wy_na.set(self.wy_na.get() + w * y);
                self.wyy_na.set(self.wyy_na.get() + w * y * y);
            }
            Some(b) => {
                self.w[b].set(self.w[b].get() + w);
                self.wy[b].set(self.wy[b].get() + w * y);
                self.wyy[b].set(self.wyy[b].get() + w * y * y);
                *self.count[b].get_mut() += 1;
                if v < self.mins[b].get() {
                    self.mins[b].set(v);
                }
                if v > self.maxs[b].get() {
                    self.maxs[b].set(v);
                }
            }
        }
    }

    /// Concurrent single-row update through compare-and-swap adds.
    pub fn update_row_shared(&self, w: f64, v: f64, y: f64) {
        match self.bin(v) {
            None => {
                self.w_na.add(w);
                self.wy_na.add(w * y);
                self.wyy_na.add(w * y * y);
            }
            Some(b) => {
                self.w[b].add(w);
                self.wy[b].add(w * y);
                self.wyy[b].add(w * y * y);
                self.count[b].fetch_add(1, Ordering::Relaxed);
                self.mins[b].min(v);
                self.maxs[b].max(v);
            }
        }
    }

    /// Exclusive accumulate over one node's contiguous row group,
    /// `rows[lo..hi]` holding chunk-local row indices.
    pub fn update_histo(
        &mut self,
        ws: &[f64],
        cs: &[f64],
        ys: &[f64],
        rows: &[usize],
        lo: usize,
        hi: usize,
    ) {
        for &r in &rows[lo..hi] {
            let w = ws[r];
            if w == 0.0 {
                continue;
            }
            self.update_row(w, cs[r], ys[r]);
        }
    }

    /// Shared-mode accumulate: batch one row group into `lb`, then flush
    /// each touched bin with a single atomic add to bound CAS traffic.
    pub fn update_shared(
        &self,
        lb: &mut LocalBins,
        ws: &[f64],
        cs: &[f64],
        ys: &[f64],
        rows: &[usize],
        lo: usize,
        hi: usize,
    ) {
        lb.reset(self.nbins);
        for &r in &rows[lo..hi] {
            let w = ws[r];
            if w == 0.0 {
                continue;
            }
            let v = cs[r];
            let y = ys[r];
            match self.bin(v) {
                None => {
                    lb.w_na += w;
                    lb.wy_na += w * y;
                    lb.wyy_na += w * y * y;
                }
                Some(b) => {
                    lb.w[b] += w;
                    lb.wy[b] += w * y;
                    lb.wyy[b] += w * y * y;
                    lb.count[b] += 1;
                    if v < lb.min[b] {
                        lb.min[b] = v;
                    }
                    if v > lb.max[b] {
                        lb.max[b] = v;
                    }
                }
            }
        }
        for b in 0..self.nbins {
            if lb.count[b] == 0 {
                continue;
            }
            self.w[b].add(lb.w[b]);
            self.wy[b].add(lb.wy[b]);
            self.wyy[b].add(lb.wyy[b]);
            self.count[b].fetch_add(lb.count[b], Ordering::Relaxed);
            self.mins[b].min(lb.min[b]);
            self.maxs[b].max(lb.max[b]);
        }
        if lb.w_na != 0.0 {
            self.w_na.add(lb.w_na);
            self.wy_na.add(lb.wy_na);
            self.wyy_na.add(lb.wyy_na);
        }
    }

    /// Fold another histogram of the same shape into this one; the
    /// pairwise reduction of deep-cloned workers.
    pub fn merge(&mut self, other: &DHistogram) {
        debug_assert_eq!(self.nbins, other.nbins);
        for b in 0..self.nbins {
            self.w[b].set(self.w[b].get() + other.w[b].get());
            self.wy[b].set(self.wy[b].get() + other.wy[b].get());
            self.wyy[b].set(self.wyy[b].get() + other.wyy[b].get());
            *self.count[b].get_mut() += other.count[b].load(Ordering::Relaxed);
            if other.mins[b].get() < self.mins[b].get() {
                self.mins[b].set(other.mins[b].get());
            }
            if other.maxs[b].get() > self.maxs[b].get() {
                self.maxs[b].set(other.maxs[b].get());
            }
        }
        self.w_na.set(self.w_na.get() + other.w_na.get());
        self.wy_na.set(self.wy_na.get() + other.wy_na.get());
        self.wyy_na.set(self.wyy_na.get() + other.wyy_na.get());
    }

    /// Zero all accumulators, keeping the bin layout.
    pub fn reset(&mut self) {
        for b in 0..self.nbins {
            self.w[b].set(0.0);
            self.wy[b].set(0.0);
            self.wyy[b].set(0.0);
            *self.count[b].get_mut() = 0;
            self.mins[b].set(f64::INFINITY);
            self.maxs[b].set(f64::NEG_INFINITY);
        }
        self.w_na.set(0.0);
        self.wy_na.set(0.0);
        self.wyy_na.set(0.0);
    }

    pub fn w(&self, b: usize) -> f64 {
        self.w[b].get()
    }

    pub fn wy(&self, b: usize) -> f64 {
        self.wy[b].get()
    }

    pub fn wyy(&self, b: usize) -> f64 {
        self.wyy[b].get()
    }

    pub fn bin_count(&self, b: usize) -> u64 {
        self.count[b].load(Ordering::Relaxed)
    }

    pub fn bin_min(&self, b: usize) -> f64 {
        self.mins[b].get()
    }

    pub fn bin_max(&self, b: usize) -> f64 {
        self.maxs[b].get()
    }

    pub fn na_w(&self) -> f64 {
        self.w_na.get()
    }

    pub fn na_wy(&self) -> f64 {
        self.wy_na.get()
    }

    pub fn na_wyy(&self) -> f64 {
        self.wyy_na.get()
    }

    /// Total weight seen by this histogram, missing rows included.
    pub fn w_total(&self) -> f64 {
        (0..self.nbins).map(|b| self.w(b)).sum::<f64>() + self.na_w()
    }

    /// Observed (min, max) of the non-missing values, if any row landed.
    pub fn observed_range(&self) -> Option<(f64, f64)> {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for b in 0..self.nbins {
            if self.bin_count(b) > 0 {
                lo = lo.min(self.bin_min(b));
                hi = hi.max(self.bin_max(b));
            }
        }
        if lo.is_finite() {
            Some((lo, hi))
        } else {
            None
        }
    }
}

impl Clone for DHistogram {
    fn clone(&self) -> Self {
        let mut out = self.fresh_copy();
        out.merge(self);
        out
    }
}

/// Per-worker scratch that batches one (chunk, node, column) row group
/// before flushing into a shared histogram.
#[derive(Debug, Default)]
pub struct LocalBins {
    w: Vec<f64>,
    wy: Vec<f64>,
    wyy: Vec<f64>,
    count: Vec<u64>,
    min: Vec<f64>,
    max: Vec<f64>,
    w_na: f64,
    wy_na: f64,
    wyy_na: f64,
}

impl LocalBins {
    pub fn new() -> Self {
        LocalBins::default()
    }

    fn reset(&mut self, nbins: usize) {
        self.w.clear();
        self.w.resize(nbins, 0.0);
        self.wy.clear();
        self.wy.resize(nbins, 0.0);
        self.wyy.clear();
        self.wyy.resize(nbins, 0.0);
        self.count.clear();
        self.count.resize(nbins, 0);
        self.min.clear();
        self.min.resize(nbins, f64::INFINITY);
        self.max.clear();
        self.max.resize(nbins, f64::NEG_INFINITY);
        self.w_na = 0.0;
        self.wy_na = 0.0;
        self.wyy_na = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_binning() {
        let h = DHistogram::uniform(0, 4, 0.0, 8.0);
        assert_eq!(h.nbins(), 4);
        assert_eq!(h.bin(0.0), Some(0));
        assert_eq!(h.bin(1.9), Some(0));
        assert_eq!(h.bin(2.0), Some(1));
        assert_eq!(h.bin(7.9), Some(3));
        // Out of range clamps to the edge bins.
        assert_eq!(h.bin(-3.0), Some(0));
        assert_eq!(h.bin(11.0), Some(3));
        assert_eq!(h.bin(f64::NAN), None);
    }

    #[test]
    fn test_edge_binning() {
        let edges = Arc::new(vec![0.0, 2.0, 5.0, 9.0]);
        let h = DHistogram::from_edges(0, edges);
        assert_eq!(h.nbins(), 3);
        assert_eq!(h.bin(0.0), Some(0));
        assert_eq!(h.bin(2.0), Some(1));
        assert_eq!(h.bin(4.9), Some(1));
        assert_eq!(h.bin(8.0), Some(2));
        assert_eq!(h.bin(100.0), Some(2));
    }

    #[test]
    fn test_categorical_folding() {
        let h = DHistogram::categorical(0, 10, 4);
        // ceil(10/4) = 3 levels per bin -> 4 bins.
        assert_eq!(h.level_step(), 3);
        assert_eq!(h.nbins(), 4);
        assert_eq!(h.bin(0.0), Some(0));
        assert_eq!(h.bin(2.0), Some(0));
        assert_eq!(h.bin(3.0), Some(1));
        assert_eq!(h.bin(9.0), Some(3));
    }

    #[test]
    fn test_update_and_totals() {
        let mut h = DHistogram::uniform(0, 2, 0.0, 4.0);
        h.update_row(1.0, 1.0, 2.0);
        h.update_row(2.0, 3.0, -1.0);
        h.update_row(0.5, f64::NAN, 4.0);
        assert_eq!(h.w(0), 1.0);
        assert_eq!(h.wy(0), 2.0);
        assert_eq!(h.wyy(0), 4.0);
        assert_eq!(h.w(1), 2.0);
        assert_eq!(h.wy(1), -2.0);
        assert_eq!(h.na_w(), 0.5);
        assert_eq!(h.w_total(), 3.5);
        assert_eq!(h.observed_range(), Some((1.0, 3.0)));
    }

    #[test]
    fn test_shared_matches_exclusive() {
        let ws = vec![1.0, 2.0, 1.0, 1.0];
        let cs = vec![0.5, 1.5, 2.5, f64::NAN];
        let ys = vec![1.0, -1.0, 0.5, 2.0];
        let rows = vec![0, 1, 2, 3];

        let mut a = DHistogram::uniform(0, 3, 0.0, 3.0);
        a.update_histo(&ws, &cs, &ys, &rows, 0, 4);

        let b = DHistogram::uniform(0, 3, 0.0, 3.0);
        let mut lb = LocalBins::new();
        b.update_shared(&mut lb, &ws, &cs, &ys, &rows, 0, 4);

        for i in 0..3 {
            assert_eq!(a.w(i), b.w(i));
            assert_eq!(a.wy(i), b.wy(i));
            assert_eq!(a.wyy(i), b.wyy(i));
            assert_eq!(a.bin_count(i), b.bin_count(i));
        }
        assert_eq!(a.na_w(), b.na_w());
    }

    #[test]
    fn test_merge() {
        let mut a = DHistogram::uniform(0, 2, 0.0, 2.0);
        let mut b = a.fresh_copy();
        a.update_row(1.0, 0.5, 1.0);
        b.update_row(1.0, 1.5, 3.0);
        a.merge(&b);
        assert_eq!(a.w(0), 1.0);
        assert_eq!(a.w(1), 1.0);
        assert_eq!(a.wy(1), 3.0);
        assert_eq!(a.observed_range(), Some((0.5, 1.5)));
    }
}
