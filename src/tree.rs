use crate::data::UNDECIDED_CHILD;
use crate::node::{DecidedNode, LeafNode, Node, Split, UndecidedNode};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const NO_PARENT: i32 = -1;

/// An append-only arena of tree nodes, root at index 0. Nodes are only
/// ever appended within a round and ids never move, so parent/child links
/// are plain indices.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DTree {
    pub nodes: Vec<Node>,
    /// The per-tree sampled column subset (sorted), None when every
    /// column is eligible.
    pub cols_per_tree: Option<Vec<usize>>,
}

impl DTree {
    pub fn new(cols_per_tree: Option<Vec<usize>>) -> Self {
        DTree {
            nodes: Vec::new(),
            cols_per_tree,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, nid: usize) -> &Node {
        &self.nodes[nid]
    }

    pub fn node_mut(&mut self, nid: usize) -> &mut Node {
        &mut self.nodes[nid]
    }

    /// Append a fresh undecided node, returning its id.
    pub fn push_undecided(&mut self, pid: i32, score_cols: Option<Vec<usize>>) -> usize {
        let nid = self.nodes.len();
        self.nodes.push(Node::Undecided(UndecidedNode { nid, pid, score_cols }));
        nid
    }

    pub fn undecided(&self, nid: usize) -> &UndecidedNode {
        match &self.nodes[nid] {
            Node::Undecided(n) => n,
            _ => unreachable!("node {} is not undecided", nid),
        }
    }

    pub fn decided(&self, nid: usize) -> &DecidedNode {
        match &self.nodes[nid] {
            Node::Decided(n) => n,
            _ => unreachable!("node {} is not decided", nid),
        }
    }

    /// Mutate an undecided node into a decided one and append its two
    /// undecided children; returns (left, right) ids.
    pub fn decide(
        &mut self,
        nid: usize,
        split: Split,
        left_cols: Option<Vec<usize>>,
        right_cols: Option<Vec<usize>>,
    ) -> (usize, usize) {
        let pid = self.nodes[nid].pid();
        let l = self.push_undecided(nid as i32, left_cols);
        let r = self.push_undecided(nid as i32, right_cols);
        self.nodes[nid] = Node::Decided(DecidedNode {
            nid,
            pid,
            split,
            children: [l as i32, r as i32],
        });
        (l, r)
    }

    /// Mutate a frontier node into a leaf; the prediction is filled in by
    /// the leaf-fit pass.
    pub fn make_leaf(&mut self, nid: usize) {
        let pid = self.nodes[nid].pid();
        self.nodes[nid] = Node::Leaf(LeafNode { nid, pid, pred: 0.0 });
    }

    pub fn leaf_pred(&self, nid: usize) -> f32 {
        match &self.nodes[nid] {
            Node::Leaf(n) => n.pred,
            _ => unreachable!("node {} is not a leaf", nid),
        }
    }

    pub fn set_leaf_pred(&mut self, nid: usize, pred: f32) {
        match &mut self.nodes[nid] {
            Node::Leaf(n) => n.pred = pred,
            _ => unreachable!("node {} is not a leaf", nid),
        }
    }

    /// The tree never split: a single root leaf.
    pub fn is_trivial(&self) -> bool {
        self.nodes.len() == 1 && self.nodes[0].is_leaf()
    }

    /// Ids of all leaf nodes, in id order.
    pub fn leaves(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .filter(|n| n.is_leaf())
            .map(|n| n.nid())
            .collect()
    }

    /// Dense remap from node id to leaf slot (usize::MAX for non-leaves),
    /// used to index per-leaf accumulator arrays.
    pub fn leaf_slots(&self) -> Vec<usize> {
        let mut slots = vec![usize::MAX; self.nodes.len()];
        for (i, nid) in self.leaves().into_iter().enumerate() {
            slots[nid] = i;
        }
        slots
    }

    /// Resolve the final leaf for a row whose last recorded assignment is
    /// `nid`; rows routed in the last layer pass sit one decision above
    /// their leaf. `value_of(col)` reads the row's raw feature value.
    pub fn final_leaf<F: Fn(usize) -> f64>(&self, nid: usize, value_of: F) -> usize {
        match &self.nodes[nid] {
            Node::Leaf(_) => nid,
            Node::Decided(dn) => {
                let child = dn.children[dn.split.direction(value_of(dn.split.col))];
                debug_assert!(child != UNDECIDED_CHILD);
                child as usize
            }
            Node::Undecided(_) => unreachable!("row assigned to an unexpanded node {}", nid),
        }
    }
}

impl fmt::Display for DTree {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut print_buffer: Vec<(usize, usize)> = vec![(0, 0)];
        while let Some((nid, depth)) = print_buffer.pop() {
            writeln!(f, "{}{}", "      ".repeat(depth), self.nodes[nid])?;
            if let Node::Decided(dn) = &self.nodes[nid] {
                print_buffer.push((dn.children[1] as usize, depth + 1));
                print_buffer.push((dn.children[0] as usize, depth + 1));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NaDirection, SplitPredicate};

    fn numeric_split(col: usize, t: f64) -> Split {
        Split {
            col,
            predicate: SplitPredicate::Threshold(t),
            na_dir: NaDirection::Left,
            improvement: 1.0,
        }
    }

    #[test]
    fn test_decide_appends_children() {
        let mut tree = DTree::new(None);
        let root = tree.push_undecided(NO_PARENT, None);
        assert_eq!(root, 0);
        let (l, r) = tree.decide(root, numeric_split(0, 1.0), None, None);
        assert_eq!((l, r), (1, 2));
        assert!(l > root && r > root);
        let dn = tree.decided(root);
        assert_eq!(dn.children, [1, 2]);
    }

    #[test]
    fn test_leaf_slots() {
        let mut tree = DTree::new(None);
        let root = tree.push_undecided(NO_PARENT, None);
        let (l, r) = tree.decide(root, numeric_split(0, 0.5), None, None);
        tree.make_leaf(l);
        tree.make_leaf(r);
        let slots = tree.leaf_slots();
        assert_eq!(slots[root], usize::MAX);
        assert_eq!(slots[l], 0);
        assert_eq!(slots[r], 1);
        assert_eq!(tree.leaves(), vec![1, 2]);
    }

    #[test]
    fn test_final_leaf_routes_one_step() {
        let mut tree = DTree::new(None);
        let root = tree.push_undecided(NO_PARENT, None);
        let (l, r) = tree.decide(root, numeric_split(0, 2.0), None, None);
        tree.make_leaf(l);
        tree.make_leaf(r);
        assert_eq!(tree.final_leaf(root, |_| 1.0), l);
        assert_eq!(tree.final_leaf(root, |_| 3.0), r);
        assert_eq!(tree.final_leaf(l, |_| 9.9), l);
    }

    #[test]
    fn test_display_does_not_panic() {
        let mut tree = DTree::new(None);
        let root = tree.push_undecided(NO_PARENT, None);
        let (l, r) = tree.decide(root, numeric_split(1, 4.0), None, None);
        tree.make_leaf(l);
        tree.make_leaf(r);
        let s = format!("{}", tree);
        assert!(s.contains("LEAF"));
    }
}
