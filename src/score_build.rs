use crate::data::{
    chunk_views, is_oob_row, nid_to_oob, oob_to_nid, Frame, DECIDED_ROW, UNDECIDED_CHILD,
};
use crate::errors::GroveError;
use crate::histogram::{DHistogram, LocalBins};
use crate::mr::{local_mr, CancelToken, Dispenser, MrFun};
use crate::node::Node;
use crate::tree::DTree;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Engine knobs for the layer histogram build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoParams {
    /// Number of columns aggregated together by one worker pool.
    pub col_block_sz: usize,
    /// Share one set of histograms between row workers instead of deep
    /// cloning per worker.
    pub shared_histo: bool,
    /// Lower bound on col_blocks x row_threads; 0 means the rayon pool
    /// width.
    pub min_threads: usize,
    /// Skip the counting sort and dispatch rows to histograms directly.
    pub unordered: bool,
}

impl Default for HistoParams {
    fn default() -> Self {
        HistoParams {
            col_block_sz: 5,
            shared_histo: false,
            min_threads: 0,
            unordered: false,
        }
    }
}

/// One layer's histograms: `by_node[n][c]` is the accumulator for the
/// undecided node `leaf_start + n` and column `c`, None for columns the
/// tree does not track.
pub struct LayerHistos {
    pub leaf_start: usize,
    pub by_node: Vec<Vec<Option<DHistogram>>>,
}

impl LayerHistos {
    pub fn new(leaf_start: usize, by_node: Vec<Vec<Option<DHistogram>>>) -> Self {
        LayerHistos { leaf_start, by_node }
    }

    pub fn layer_len(&self) -> usize {
        self.by_node.len()
    }

    pub fn hist(&self, n: usize, c: usize) -> Option<&DHistogram> {
        self.by_node[n][c].as_ref()
    }
}

/// Chunk-local routing output of pass 1: `nh` holds the prefix-summed
/// rows-per-node counts (indexed by layer-relative nid, length
/// layer_len + 1) and `rss` the chunk row indices grouped by node.
/// `nnids` is only kept for the unordered mode.
pub struct ChunkRoutes {
    pub nh: Vec<usize>,
    pub rss: Vec<usize>,
    pub nnids: Vec<i32>,
}

/// Pass 1: score every row of one chunk against the prior layer's
/// decisions, write the new assignment into the nids chunk, and group the
/// active rows by their new node.
fn route_chunk(
    frame: &Frame,
    tree: &DTree,
    leaf_start: usize,
    layer_len: usize,
    base_row: usize,
    nids: &mut [i32],
    ys: &[f64],
    weights: Option<&[f64]>,
    unordered: bool,
) -> ChunkRoutes {
    let mut nnids = vec![DECIDED_ROW; nids.len()];
    for (row, nid_slot) in nids.iter_mut().enumerate() {
        let w = weights.map_or(1.0, |w| w[base_row + row]);
        if w == 0.0 || ys[base_row + row].is_nan() {
            continue;
        }
        let mut nid = *nid_slot;
        let oob = is_oob_row(nid);
        if oob {
            nid = oob_to_nid(nid);
        }
        if nid == DECIDED_ROW || nid == UNDECIDED_CHILD {
            continue;
        }
        let new_nid = match tree.node(nid as usize) {
            // Terminated at a leaf in a prior layer; assignment is final.
            Node::Leaf(_) => {
                *nid_slot = if oob { nid_to_oob(nid) } else { nid };
                continue;
            }
            Node::Decided(dn) => {
                let v = frame.col(dn.split.col).data[base_row + row];
                dn.children[dn.split.direction(v)]
            }
            // Only the root layer scores against an undecided node: the
            // row is already where it belongs.
            Node::Undecided(_) => nid,
        };
        *nid_slot = if oob { nid_to_oob(new_nid) } else { new_nid };
        if !oob {
            nnids[row] = new_nid - leaf_start as i32;
        }
    }

    if unordered {
        return ChunkRoutes {
            nh: Vec::new(),
            rss: Vec::new(),
            nnids,
        };
    }

    // Counting sort: group the active rows of this chunk by their new
    // node so pass 2 can walk each node's rows contiguously.
    let mut nh = vec![0usize; layer_len + 1];
    for &n in &nnids {
        if n >= 0 {
            nh[n as usize + 1] += 1;
        }
    }
    for i in 0..layer_len {
        nh[i + 1] += nh[i];
    }
    let mut cursor: Vec<usize> = nh[..layer_len].to_vec();
    let mut rss = vec![0usize; nh[layer_len]];
    for (row, &n) in nnids.iter().enumerate() {
        if n >= 0 {
            rss[cursor[n as usize]] = row;
            cursor[n as usize] += 1;
        }
    }
    ChunkRoutes {
        nh,
        rss,
        nnids: Vec::new(),
    }
}

/// Pass 1 over all chunks in parallel. Writes new node assignments into
/// `nids` and returns the per-chunk routing tables.
pub fn score_and_route(
    frame: &Frame,
    tree: &DTree,
    leaf_start: usize,
    layer_len: usize,
    nids: &mut [i32],
    ys: &[f64],
    weights: Option<&[f64]>,
    unordered: bool,
) -> Vec<ChunkRoutes> {
    let espc = frame.espc().to_vec();
    let nid_chunks = chunk_views(nids, &espc);
    nid_chunks
        .into_par_iter()
        .enumerate()
        .map(|(cidx, chunk)| {
            route_chunk(
                frame,
                tree,
                leaf_start,
                layer_len,
                espc[cidx],
                chunk,
                ys,
                weights,
                unordered,
            )
        })
        .collect()
}

/// The per-column-block row worker of pass 2. Workers pull chunk ids from
/// a shared dispenser; in shared mode they update the main histograms
/// through batched atomic adds, otherwise each owns a deep clone that is
/// reduced pairwise when the task tree joins.
struct ComputeHistoFun<'a> {
    frame: &'a Frame,
    tree: &'a DTree,
    hcs: &'a LayerHistos,
    routes: &'a [ChunkRoutes],
    work: &'a [f64],
    weights: Option<&'a [f64]>,
    params: &'a HistoParams,
    col_from: usize,
    col_to: usize,
    /// Deep-cloned histograms, [node][col - col_from] when ordered,
    /// [col - col_from][node] when unordered. Empty in shared mode.
    owned: Vec<Vec<Option<DHistogram>>>,
    dispenser: &'a Dispenser,
    cs: Vec<f64>,
    ones: Vec<f64>,
    lb: LocalBins,
}

impl<'a> ComputeHistoFun<'a> {
    fn new(
        frame: &'a Frame,
        tree: &'a DTree,
        hcs: &'a LayerHistos,
        routes: &'a [ChunkRoutes],
        work: &'a [f64],
        weights: Option<&'a [f64]>,
        params: &'a HistoParams,
        col_from: usize,
        col_to: usize,
        dispenser: &'a Dispenser,
    ) -> Self {
        let mut fun = ComputeHistoFun {
            frame,
            tree,
            hcs,
            routes,
            work,
            weights,
            params,
            col_from,
            col_to,
            owned: Vec::new(),
            dispenser,
            cs: vec![0.0; frame.largest_chunk()],
            ones: vec![1.0; frame.largest_chunk()],
            lb: LocalBins::new(),
        };
        if !params.shared_histo {
            fun.owned = fun.fresh_block();
        }
        fun
    }

    /// Zeroed clones of this block's histograms, laid out for the mode.
    fn fresh_block(&self) -> Vec<Vec<Option<DHistogram>>> {
        let cols = self.col_from..self.col_to;
        if self.params.unordered {
            // Column-major so the per-row dispatch stays within one
            // column's histograms.
            cols.map(|c| {
                (0..self.hcs.layer_len())
                    .map(|n| self.hcs.hist(n, c).map(DHistogram::fresh_copy))
                    .collect()
            })
            .collect()
        } else {
            (0..self.hcs.layer_len())
                .map(|n| {
                    cols.clone()
                        .map(|c| self.hcs.hist(n, c).map(DHistogram::fresh_copy))
                        .collect()
                })
                .collect()
        }
    }

    fn compute_chunk(&mut self, cidx: usize) {
        let range = self.frame.chunk_range(cidx);
        let len = range.len();
        let ys = &self.work[range.clone()];
        let ws: &[f64] = match self.weights {
            Some(w) => &w[range.clone()],
            None => &self.ones[..len],
        };
        let routes = &self.routes[cidx];
        let layer_len = self.hcs.layer_len();
        let shared = self.params.shared_histo;

        for c in self.col_from..self.col_to {
            if self.params.unordered {
                let n_rows = self.frame.fill_chunk(c, cidx, &mut self.cs);
                debug_assert_eq!(n_rows, len);
                let col_local = c - self.col_from;
                for r in 0..len {
                    let nid = routes.nnids[r];
                    if nid < 0 {
                        continue;
                    }
                    let w = ws[r];
                    if w == 0.0 {
                        continue;
                    }
                    if shared {
                        if let Some(h) = self.hcs.hist(nid as usize, c) {
                            h.update_row_shared(w, self.cs[r], ys[r]);
                        }
                    } else if let Some(h) = self.owned[col_local][nid as usize].as_mut() {
                        h.update_row(w, self.cs[r], ys[r]);
                    }
                }
            } else {
                let mut extracted = false;
                for n in 0..layer_len {
                    let lo = routes.nh[n];
                    let hi = routes.nh[n + 1];
                    if lo == hi {
                        continue;
                    }
                    if !self.tree.undecided(self.hcs.leaf_start + n).tracks(c) {
                        continue;
                    }
                    let has_hist = if shared {
                        self.hcs.hist(n, c).is_some()
                    } else {
                        self.owned[n][c - self.col_from].is_some()
                    };
                    if !has_hist {
                        continue;
                    }
                    if !extracted {
                        self.frame.fill_chunk(c, cidx, &mut self.cs);
                        extracted = true;
                    }
                    if shared {
                        if let Some(h) = self.hcs.hist(n, c) {
                            h.update_shared(&mut self.lb, ws, &self.cs, ys, &routes.rss, lo, hi);
                        }
                    } else if let Some(h) = self.owned[n][c - self.col_from].as_mut() {
                        h.update_histo(ws, &self.cs, ys, &routes.rss, lo, hi);
                    }
                }
            }
        }
    }
}

impl<'a> MrFun for ComputeHistoFun<'a> {
    fn map(&mut self, _task_id: usize) -> Result<(), GroveError> {
        while let Some(cidx) = self.dispenser.next() {
            self.compute_chunk(cidx);
        }
        Ok(())
    }

    fn make_copy(&self) -> Self {
        ComputeHistoFun::new(
            self.frame,
            self.tree,
            self.hcs,
            self.routes,
            self.work,
            self.weights,
            self.params,
            self.col_from,
            self.col_to,
            self.dispenser,
        )
    }

    fn reduce(&mut self, other: Self) {
        if self.params.shared_histo {
            return;
        }
        for (mine, theirs) in self.owned.iter_mut().zip(other.owned) {
            for (m, t) in mine.iter_mut().zip(theirs) {
                if let (Some(m), Some(t)) = (m.as_mut(), t) {
                    m.merge(&t);
                }
            }
        }
    }
}

/// Round the column block size up so a trailing remainder block is never
/// smaller than half a block.
fn round_block_sz(ncols: usize, requested: usize) -> usize {
    let mut sz = requested.clamp(1, ncols);
    while 0 < ncols - sz && ncols % sz != 0 && ncols % sz < (sz >> 1) {
        sz += 1;
    }
    sz
}

/// Pass 2: aggregate the routed rows of every chunk into the layer's
/// histograms, parallel over column blocks x row workers.
pub fn build_layer_histos(
    frame: &Frame,
    tree: &DTree,
    hcs: &mut LayerHistos,
    routes: &[ChunkRoutes],
    work: &[f64],
    weights: Option<&[f64]>,
    params: &HistoParams,
    cancel: &CancelToken,
) -> Result<(), GroveError> {
    let ncols = frame.ncols();
    let col_block_sz = round_block_sz(ncols, params.col_block_sz);
    let ncol_blocks = ncols.div_ceil(col_block_sz);
    let min_threads = if params.min_threads == 0 {
        rayon::current_num_threads()
    } else {
        params.min_threads
    };
    let mut nrow_threads = 1;
    while ncol_blocks * nrow_threads < min_threads {
        nrow_threads += 1;
    }
    log::info!(
        "column block sz = {}, nthreads per block = {}, shared histo = {}",
        col_block_sz,
        nrow_threads,
        params.shared_histo
    );

    let blocks: Vec<(usize, usize)> = (0..ncol_blocks)
        .map(|b| {
            let from = b * col_block_sz;
            (from, (from + col_block_sz).min(ncols))
        })
        .collect();

    let hcs_ref: &LayerHistos = hcs;
    let merged: Vec<Result<Vec<Vec<Option<DHistogram>>>, GroveError>> = blocks
        .par_iter()
        .map(|&(col_from, col_to)| {
            let dispenser = Dispenser::new(frame.num_chunks());
            let fun = ComputeHistoFun::new(
                frame, tree, hcs_ref, routes, work, weights, params, col_from, col_to, &dispenser,
            );
            local_mr(fun, nrow_threads, cancel).map(|f| f.owned)
        })
        .collect();

    for (block, result) in blocks.iter().zip(merged) {
        let owned = result?;
        if params.shared_histo {
            continue;
        }
        let &(col_from, col_to) = block;
        for n in 0..hcs.layer_len() {
            for c in col_from..col_to {
                let merged_hist = if params.unordered {
                    &owned[c - col_from][n]
                } else {
                    &owned[n][c - col_from]
                };
                if let (Some(dst), Some(src)) = (hcs.by_node[n][c].as_mut(), merged_hist.as_ref()) {
                    dst.merge(src);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Column, FRESH};
    use crate::tree::NO_PARENT;
    use std::sync::Arc;

    fn small_frame() -> Frame {
        let x = Column::numeric("x", vec![0.5, 1.5, 2.5, 3.5, 0.1, 1.1, 2.1, 3.1, 0.9]);
        Frame::new(vec![x], 4).unwrap()
    }

    fn root_layer(frame: &Frame) -> (DTree, LayerHistos) {
        let mut tree = DTree::new(None);
        tree.push_undecided(NO_PARENT, None);
        let edges = Arc::new(vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        let hist = DHistogram::from_edges(0, edges);
        let hcs = LayerHistos::new(0, vec![vec![Some(hist)]]);
        (tree, hcs)
    }

    #[test]
    fn test_route_groups_rows_by_node() {
        let frame = small_frame();
        let tree = {
            let mut t = DTree::new(None);
            t.push_undecided(NO_PARENT, None);
            t
        };
        let mut nids = vec![FRESH; frame.nrows()];
        let ys = vec![1.0; frame.nrows()];
        let routes = score_and_route(&frame, &tree, 0, 1, &mut nids, &ys, None, false);
        assert_eq!(routes.len(), frame.num_chunks());
        // Every row is active and lands on the root.
        let total: usize = routes.iter().map(|r| *r.nh.last().unwrap()).sum();
        assert_eq!(total, frame.nrows());
        assert!(nids.iter().all(|&n| n == 0));
    }

    #[test]
    fn test_zero_weight_and_nan_rows_are_skipped() {
        let frame = small_frame();
        let tree = {
            let mut t = DTree::new(None);
            t.push_undecided(NO_PARENT, None);
            t
        };
        let mut nids = vec![FRESH; frame.nrows()];
        let mut ys = vec![1.0; frame.nrows()];
        ys[2] = f64::NAN;
        let mut ws = vec![1.0; frame.nrows()];
        ws[0] = 0.0;
        let routes = score_and_route(&frame, &tree, 0, 1, &mut nids, &ys, Some(&ws), false);
        let total: usize = routes.iter().map(|r| *r.nh.last().unwrap()).sum();
        assert_eq!(total, frame.nrows() - 2);
    }

    #[test]
    fn test_bin_weights_sum_to_active_weight() {
        let frame = small_frame();
        let (tree, mut hcs) = root_layer(&frame);
        let mut nids = vec![FRESH; frame.nrows()];
        let work: Vec<f64> = (0..frame.nrows()).map(|i| i as f64 * 0.1).collect();
        let routes = score_and_route(&frame, &tree, 0, 1, &mut nids, &work, None, false);
        let params = HistoParams::default();
        let cancel = CancelToken::new();
        build_layer_histos(&frame, &tree, &mut hcs, &routes, &work, None, &params, &cancel).unwrap();
        let h = hcs.hist(0, 0).unwrap();
        assert_eq!(h.w_total(), frame.nrows() as f64);
        let wy_total: f64 = (0..h.nbins()).map(|b| h.wy(b)).sum();
        let expect: f64 = work.iter().sum();
        assert!((wy_total - expect).abs() < 1e-12);
    }

    #[test]
    fn test_shared_cloned_and_unordered_agree() {
        let frame = small_frame();
        let work: Vec<f64> = (0..frame.nrows()).map(|i| (i as f64).sin()).collect();

        let mut results = Vec::new();
        for (shared, unordered) in [(false, false), (true, false), (false, true), (true, true)] {
            let (tree, mut hcs) = root_layer(&frame);
            let mut nids = vec![FRESH; frame.nrows()];
            let routes =
                score_and_route(&frame, &tree, 0, 1, &mut nids, &work, None, unordered);
            let params = HistoParams {
                shared_histo: shared,
                unordered,
                min_threads: 4,
                ..HistoParams::default()
            };
            let cancel = CancelToken::new();
            build_layer_histos(&frame, &tree, &mut hcs, &routes, &work, None, &params, &cancel)
                .unwrap();
            results.push(hcs);
        }
        let base = results[0].hist(0, 0).unwrap();
        for other in &results[1..] {
            let h = other.hist(0, 0).unwrap();
            for b in 0..base.nbins() {
                assert!((base.w(b) - h.w(b)).abs() < 1e-10);
                assert!((base.wy(b) - h.wy(b)).abs() < 1e-10);
                assert!((base.wyy(b) - h.wyy(b)).abs() < 1e-10);
                assert_eq!(base.bin_count(b), h.bin_count(b));
            }
        }
    }

    #[test]
    fn test_block_rounding() {
        assert_eq!(round_block_sz(10, 5), 5);
        assert_eq!(round_block_sz(3, 5), 3);
        // 10 % 4 = 2 < 2? no: 2 == 4 >> 1, keeps 4.
        assert_eq!(round_block_sz(10, 4), 4);
        // 11 % 4 = 3 >= 2, keeps 4.
        assert_eq!(round_block_sz(11, 4), 4);
        // 13 % 6 = 1 < 3 -> grow until the remainder is not tiny.
        assert!(round_block_sz(13, 6) > 6);
    }
}
