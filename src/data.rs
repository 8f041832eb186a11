use crate::errors::GroveError;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Node-id sentinels stored in the `NIDS` scratch columns. A row that is
/// still in play holds the id of the undecided node it currently sits in;
/// everything else is encoded below zero.
pub const FRESH: i32 = 0;
pub const UNDECIDED_CHILD: i32 = -1;
pub const DECIDED_ROW: i32 = -2;
pub const OUT_OF_BAG: i32 = -3;

pub fn is_oob_row(nid: i32) -> bool {
    nid <= OUT_OF_BAG
}

/// Encode a node id as out-of-bag, keeping the assignment recoverable.
pub fn nid_to_oob(nid: i32) -> i32 {
    OUT_OF_BAG - nid
}

pub fn oob_to_nid(nid: i32) -> i32 {
    OUT_OF_BAG - nid
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Numeric,
    Categorical,
}

/// A single feature column. Categorical columns hold level codes as
/// floats, indexing into `domain`; missing values are NaN in either kind.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    pub data: Vec<f64>,
    pub domain: Vec<String>,
}

impl Column {
    pub fn numeric<S: Into<String>>(name: S, data: Vec<f64>) -> Self {
        Column {
            name: name.into(),
            kind: ColumnKind::Numeric,
            data,
            domain: Vec::new(),
        }
    }

    pub fn categorical<S: Into<String>>(name: S, data: Vec<f64>, domain: Vec<String>) -> Self {
        Column {
            name: name.into(),
            kind: ColumnKind::Categorical,
            data,
            domain,
        }
    }

    pub fn cardinality(&self) -> usize {
        self.domain.len()
    }
}

/// An ordered list of feature columns sharing one chunk layout. Chunks are
/// the smallest unit of per-row parallel work; every column is partitioned
/// at the same row boundaries.
pub struct Frame {
    columns: Vec<Column>,
    espc: Vec<usize>,
    nrows: usize,
}

impl Frame {
    /// Build a frame over the given columns, partitioned into chunks of
    /// (at most) `chunk_size` rows.
    pub fn new(columns: Vec<Column>, chunk_size: usize) -> Result<Self, GroveError> {
        if columns.is_empty() {
            return Err(GroveError::invalid("columns", "at least one feature column is required"));
        }
        if chunk_size == 0 {
            return Err(GroveError::invalid("chunk_size", "must be positive"));
        }
        let nrows = columns[0].data.len();
        for c in &columns {
            if c.data.len() != nrows {
                return Err(GroveError::invalid(
                    "columns",
                    format!("column `{}` has {} rows, expected {}", c.name, c.data.len(), nrows),
                ));
            }
        }
        let mut espc = Vec::with_capacity(nrows / chunk_size + 2);
        let mut at = 0;
        while at < nrows {
            espc.push(at);
            at += chunk_size;
        }
        espc.push(nrows);
        Ok(Frame { columns, espc, nrows })
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    pub fn num_chunks(&self) -> usize {
        self.espc.len() - 1
    }

    pub fn chunk_range(&self, cidx: usize) -> Range<usize> {
        self.espc[cidx]..self.espc[cidx + 1]
    }

    pub fn chunk_len(&self, cidx: usize) -> usize {
        self.espc[cidx + 1] - self.espc[cidx]
    }

    /// Length of the largest chunk, used to size per-worker buffers once.
    pub fn largest_chunk(&self) -> usize {
        (0..self.num_chunks())
            .map(|i| self.chunk_len(i))
            .max()
            .unwrap_or(0)
    }

    pub fn espc(&self) -> &[usize] {
        &self.espc
    }

    pub fn col(&self, c: usize) -> &Column {
        &self.columns[c]
    }

    pub fn column_kind(&self, c: usize) -> ColumnKind {
        self.columns[c].kind
    }

    pub fn domain(&self, c: usize) -> &[String] {
        &self.columns[c].domain
    }

    /// Dense values of one column within one chunk.
    pub fn chunk(&self, c: usize, cidx: usize) -> &[f64] {
        &self.columns[c].data[self.chunk_range(cidx)]
    }

    /// Copy one column chunk into the prefix of a caller-owned buffer,
    /// returning the number of rows written.
    pub fn fill_chunk(&self, c: usize, cidx: usize, out: &mut [f64]) -> usize {
        let src = self.chunk(c, cidx);
        out[..src.len()].copy_from_slice(src);
        src.len()
    }

    /// Observed (min, max) of a column ignoring missing values, None when
    /// every value is missing.
    pub fn col_range(&self, c: usize) -> Option<(f64, f64)> {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for &v in &self.columns[c].data {
            if v.is_nan() {
                continue;
            }
            lo = lo.min(v);
            hi = hi.max(v);
        }
        lo.is_finite().then_some((lo, hi))
    }
}

/// Split a column into per-chunk disjoint mutable views, so chunk-parallel
/// passes can write without locks.
pub fn chunk_views<'a, T>(data: &'a mut [T], espc: &[usize]) -> Vec<&'a mut [T]> {
    let mut rest = data;
    let mut out = Vec::with_capacity(espc.len().saturating_sub(1));
    for w in espc.windows(2) {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(w[1] - w[0]);
        out.push(head);
        rest = tail;
    }
    out
}

/// Regroup per-class chunk views into per-chunk bundles: the outer vector
/// is indexed by chunk, the inner by class.
pub fn by_chunk<T>(per_class: Vec<Vec<T>>) -> Vec<Vec<T>> {
    let nchunks = per_class.first().map_or(0, |v| v.len());
    let mut out: Vec<Vec<T>> = (0..nchunks)
        .map(|_| Vec::with_capacity(per_class.len()))
        .collect();
    for class_vec in per_class {
        for (i, item) in class_vec.into_iter().enumerate() {
            out[i].push(item);
        }
    }
    out
}

/// The per-round scratch columns: for every class `k`, the running
/// ensemble sum `TREE[k]`, the residual `WORK[k]` and the node assignment
/// `NIDS[k]`. `TREE` persists across rounds, the other two are rewritten
/// every round.
pub struct Scratch {
    pub tree: Vec<Vec<f64>>,
    pub work: Vec<Vec<f64>>,
    pub nids: Vec<Vec<i32>>,
}

impl Scratch {
    pub fn new(nclass: usize, nrows: usize) -> Self {
        Scratch {
            tree: vec![vec![0.0; nrows]; nclass],
            work: vec![vec![0.0; nrows]; nclass],
            nids: vec![vec![FRESH; nrows]; nclass],
        }
    }

    pub fn nclass(&self) -> usize {
        self.tree.len()
    }
}
