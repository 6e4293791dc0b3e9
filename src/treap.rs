//! Free-space index: a treap keyed by interval start, heap-ordered by
//! interval size, threaded with an in-order doubly-linked list.

use std::collections::VecDeque;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// An inclusive range of unoccupied buffer offsets.
///
/// A span with `start > end` is empty; writers produce one when they consume
/// their whole reservation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FreeSpan {
    pub start: u64,
    pub end: u64,
}

impl FreeSpan {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn size(&self) -> u64 {
        if self.start > self.end {
            0
        } else {
            self.end - self.start + 1
        }
    }

    /// True when the two spans touch end-to-start with no gap. Interior
    /// intersection never occurs in a healthy index.
    pub fn abuts(&self, other: &FreeSpan) -> bool {
        self.start == other.end + 1 || other.start == self.end + 1
    }
}

const EMPTY_SPAN: FreeSpan = FreeSpan { start: 1, end: 0 };

#[derive(Clone, Copy, Debug)]
struct Node {
    span: FreeSpan,
    left: Option<usize>,
    right: Option<usize>,
    parent: Option<usize>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Node {
    fn new(span: FreeSpan) -> Self {
        Self {
            span,
            left: None,
            right: None,
            parent: None,
            prev: None,
            next: None,
        }
    }
}

/// Treap over free spans. Nodes live in a slab and removed slots are
/// recycled, so the index allocates only while growing past its high-water
/// mark.
pub struct FreeTreap {
    nodes: Vec<Node>,
    spare: Vec<usize>,
    root: Option<usize>,
    len: usize,
    rng: SmallRng,
}

impl FreeTreap {
    pub fn new() -> Self {
        Self::with_rng(SmallRng::from_entropy())
    }

    fn with_rng(rng: SmallRng) -> Self {
        Self {
            nodes: Vec::new(),
            spare: Vec::new(),
            root: None,
            len: 0,
            rng,
        }
    }

    /// Size of the largest free span, which the heap order keeps at the root.
    pub fn max_size(&self) -> u64 {
        self.root.map_or(0, |r| self.nodes[r].span.size())
    }

    /// Adds a span, merging with an abutting neighbour instead of inserting
    /// when one exists. A merge that bridges the gap to the in-order
    /// neighbour on the far side absorbs that neighbour too.
    pub fn insert(&mut self, span: FreeSpan) {
        debug_assert!(span.size() > 0, "empty span inserted into treap");
        if let Some(at) = self.find_abutting(span) {
            self.absorb(at, span);
            return;
        }
        let id = self.alloc(span);
        self.attach_leaf(id);
        self.sift_up(id);
    }

    /// Walks from the root toward the highest-gravity node whose children are
    /// only considered while they satisfy `min_size`. The caller must ensure
    /// the root itself satisfies `min_size`.
    pub fn greatest_gravity(&self, min_size: u64) -> Option<usize> {
        let mut cur = self.root?;
        loop {
            let node = &self.nodes[cur];
            let eligible =
                |c: Option<usize>| c.filter(|&i| self.nodes[i].span.size() >= min_size);
            let mut best = cur;
            let mut best_g = self.gravity(cur);
            for child in [eligible(node.left), eligible(node.right)]
                .into_iter()
                .flatten()
            {
                let g = self.gravity(child);
                if g > best_g {
                    best = child;
                    best_g = g;
                }
            }
            if best == cur {
                return Some(cur);
            }
            cur = best;
        }
    }

    /// Starting from `from`, accumulates in-order neighbours (forward first,
    /// then backward once `next` is exhausted) until the collected size
    /// reaches `required`, removes every collected node, and returns the
    /// spans in ascending address order together with the total taken.
    ///
    /// Panics if the whole index cannot cover `required`; the free-space
    /// manager checks the total under the same lock, so hitting this means
    /// the size accounting is corrupt.
    pub fn take_fitting(&mut self, from: usize, required: u64) -> (Vec<FreeSpan>, u64) {
        let mut picked = VecDeque::new();
        picked.push_back(from);
        let mut total = self.nodes[from].span.size();
        let mut forward = self.nodes[from].next;
        let mut backward = self.nodes[from].prev;
        while total < required {
            if let Some(n) = forward {
                total += self.nodes[n].span.size();
                picked.push_back(n);
                forward = self.nodes[n].next;
            } else if let Some(p) = backward {
                total += self.nodes[p].span.size();
                picked.push_front(p);
                backward = self.nodes[p].prev;
            } else {
                panic!("free-space index cannot cover a reserved extraction");
            }
        }
        let spans: Vec<FreeSpan> = picked.iter().map(|&i| self.nodes[i].span).collect();
        for i in picked {
            self.remove(i);
        }
        (spans, total)
    }

    /// Detaches `id` from the tree and the in-order list, recycles its slot,
    /// and returns its span. The node is rotated toward a leaf, promoting the
    /// larger child at each step so the heap order survives.
    fn remove(&mut self, id: usize) -> FreeSpan {
        let pv = self.nodes[id].prev;
        let nx = self.nodes[id].next;
        if let Some(pv) = pv {
            self.nodes[pv].next = nx;
        }
        if let Some(nx) = nx {
            self.nodes[nx].prev = pv;
        }
        loop {
            match (self.nodes[id].left, self.nodes[id].right) {
                (Some(l), Some(r)) => {
                    let up = if self.nodes[l].span.size() > self.nodes[r].span.size() {
                        l
                    } else {
                        r
                    };
                    self.rotate_up(up);
                }
                _ => break,
            }
        }
        let child = self.nodes[id].left.or(self.nodes[id].right);
        let parent = self.nodes[id].parent;
        if let Some(c) = child {
            self.nodes[c].parent = parent;
        }
        match parent {
            Some(p) => {
                if self.nodes[p].left == Some(id) {
                    self.nodes[p].left = child;
                } else {
                    self.nodes[p].right = child;
                }
            }
            None => self.root = child,
        }
        let span = self.nodes[id].span;
        self.release(id);
        span
    }

    fn gravity(&self, id: usize) -> f64 {
        match self.nodes[id].next {
            Some(nx) => {
                let a = self.nodes[id].span;
                let b = self.nodes[nx].span;
                let d = (b.start - a.end) as f64;
                a.size() as f64 * b.size() as f64 / (d * d)
            }
            None => -1.0,
        }
    }

    /// Finds a node abutting `span` if one exists. Both candidates (the
    /// in-order predecessor and successor of the insertion point) lie on the
    /// BST search path, so a single descent suffices.
    fn find_abutting(&self, span: FreeSpan) -> Option<usize> {
        let mut cur = self.root;
        while let Some(i) = cur {
            let s = self.nodes[i].span;
            if s.abuts(&span) {
                return Some(i);
            }
            cur = if span_greater(s, span) {
                self.nodes[i].left
            } else {
                self.nodes[i].right
            };
        }
        None
    }

    /// Expands the node at `at` by the abutting `span`. When the expansion
    /// closes the gap to the in-order neighbour on the far side, that
    /// neighbour is removed and absorbed as well. The grown node is then
    /// sifted up to restore the heap order.
    fn absorb(&mut self, at: usize, span: FreeSpan) {
        let bridged = self.nodes[at]
            .next
            .filter(|&n| self.nodes[n].span.abuts(&span))
            .or_else(|| {
                self.nodes[at]
                    .prev
                    .filter(|&p| self.nodes[p].span.abuts(&span))
            });
        if let Some(other) = bridged {
            let other_span = self.remove(other);
            self.expand(at, other_span);
        }
        self.expand(at, span);
        self.sift_up(at);
    }

    fn expand(&mut self, at: usize, span: FreeSpan) {
        let s = &mut self.nodes[at].span;
        if span.start < s.start {
            s.start = span.start;
        }
        if span.end > s.end {
            s.end = span.end;
        }
    }

    /// BST descent placing `id` as a leaf and threading it into the in-order
    /// list next to its parent.
    fn attach_leaf(&mut self, id: usize) {
        let mut cur = match self.root {
            Some(r) => r,
            None => {
                self.root = Some(id);
                return;
            }
        };
        loop {
            if span_greater(self.nodes[cur].span, self.nodes[id].span) {
                match self.nodes[cur].left {
                    Some(l) => cur = l,
                    None => {
                        self.nodes[cur].left = Some(id);
                        self.nodes[id].parent = Some(cur);
                        // a left child sits just before its parent in order
                        let pv = self.nodes[cur].prev;
                        self.nodes[id].prev = pv;
                        self.nodes[id].next = Some(cur);
                        self.nodes[cur].prev = Some(id);
                        if let Some(pv) = pv {
                            self.nodes[pv].next = Some(id);
                        }
                        return;
                    }
                }
            } else {
                match self.nodes[cur].right {
                    Some(r) => cur = r,
                    None => {
                        self.nodes[cur].right = Some(id);
                        self.nodes[id].parent = Some(cur);
                        let nx = self.nodes[cur].next;
                        self.nodes[id].next = nx;
                        self.nodes[id].prev = Some(cur);
                        self.nodes[cur].next = Some(id);
                        if let Some(nx) = nx {
                            self.nodes[nx].prev = Some(id);
                        }
                        return;
                    }
                }
            }
        }
    }

    /// Rotates `id` toward the root while it outweighs its parent. Ties
    /// rotate with probability 1/2 per comparison; without the coin flip,
    /// monotone insertion (a buffer filling front to back) degenerates the
    /// tree into a chain.
    fn sift_up(&mut self, id: usize) {
        while let Some(p) = self.nodes[id].parent {
            let s = self.nodes[id].span.size();
            let ps = self.nodes[p].span.size();
            let promote = s > ps || (s == ps && self.rng.gen_bool(0.5));
            if !promote {
                break;
            }
            self.rotate_up(id);
        }
    }

    /// Single rotation promoting `x` above its parent, preserving BST order
    /// and all parent links.
    fn rotate_up(&mut self, x: usize) {
        let p = match self.nodes[x].parent {
            Some(p) => p,
            None => return,
        };
        let g = self.nodes[p].parent;
        if self.nodes[p].left == Some(x) {
            let b = self.nodes[x].right;
            self.nodes[p].left = b;
            if let Some(b) = b {
                self.nodes[b].parent = Some(p);
            }
            self.nodes[x].right = Some(p);
        } else {
            let b = self.nodes[x].left;
            self.nodes[p].right = b;
            if let Some(b) = b {
                self.nodes[b].parent = Some(p);
            }
            self.nodes[x].left = Some(p);
        }
        self.nodes[p].parent = Some(x);
        self.nodes[x].parent = g;
        match g {
            Some(g) => {
                if self.nodes[g].left == Some(p) {
                    self.nodes[g].left = Some(x);
                } else {
                    self.nodes[g].right = Some(x);
                }
            }
            None => self.root = Some(x),
        }
    }

    fn alloc(&mut self, span: FreeSpan) -> usize {
        self.len += 1;
        match self.spare.pop() {
            Some(i) => {
                self.nodes[i] = Node::new(span);
                i
            }
            None => {
                self.nodes.push(Node::new(span));
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, id: usize) {
        self.len -= 1;
        self.nodes[id] = Node::new(EMPTY_SPAN);
        self.spare.push(id);
    }
}

/// Ordering used for BST placement: by start, then by end.
fn span_greater(a: FreeSpan, b: FreeSpan) -> bool {
    if a.start == b.start {
        a.end > b.end
    } else {
        a.start > b.start
    }
}

#[cfg(test)]
impl FreeTreap {
    /// Deterministic construction for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(SmallRng::seed_from_u64(seed))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free spans in ascending address order.
    pub fn spans_in_order(&self) -> Vec<FreeSpan> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.root.map(|mut i| {
            while let Some(l) = self.nodes[i].left {
                i = l;
            }
            i
        });
        while let Some(i) = cur {
            out.push(self.nodes[i].span);
            cur = self.nodes[i].next;
        }
        out
    }

    /// Asserts every structural invariant: BST order on start, max-heap on
    /// size, parent back-pointers, a coherent in-order linked list, and
    /// pairwise non-adjacent spans.
    pub fn check_invariants(&self) {
        let mut inorder = Vec::new();
        if let Some(r) = self.root {
            assert_eq!(self.nodes[r].parent, None, "root has a parent");
            self.check_subtree(r, &mut inorder);
        }
        assert_eq!(inorder.len(), self.len, "node count mismatch");

        // linked list must mirror the in-order traversal in both directions
        let mut cur = self.root.map(|mut i| {
            while let Some(l) = self.nodes[i].left {
                i = l;
            }
            i
        });
        let mut seen = Vec::new();
        let mut last: Option<usize> = None;
        while let Some(i) = cur {
            assert_eq!(self.nodes[i].prev, last, "prev pointer mismatch");
            seen.push(i);
            last = Some(i);
            cur = self.nodes[i].next;
        }
        assert_eq!(seen, inorder, "linked list diverges from in-order walk");

        for pair in inorder.windows(2) {
            let a = self.nodes[pair[0]].span;
            let b = self.nodes[pair[1]].span;
            assert!(a.end + 1 < b.start, "adjacent or overlapping spans at rest");
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(t: &FreeTreap, at: Option<usize>) -> usize {
            match at {
                None => 0,
                Some(i) => 1 + walk(t, t.nodes[i].left).max(walk(t, t.nodes[i].right)),
            }
        }
        walk(self, self.root)
    }

    fn check_subtree(&self, at: usize, inorder: &mut Vec<usize>) {
        let node = &self.nodes[at];
        if let Some(l) = node.left {
            assert_eq!(self.nodes[l].parent, Some(at), "left child parent link");
            assert!(
                span_greater(node.span, self.nodes[l].span),
                "BST order violated on the left"
            );
            assert!(
                self.nodes[l].span.size() <= node.span.size(),
                "heap order violated on the left"
            );
            self.check_subtree(l, inorder);
        }
        inorder.push(at);
        if let Some(r) = node.right {
            assert_eq!(self.nodes[r].parent, Some(at), "right child parent link");
            assert!(
                span_greater(self.nodes[r].span, node.span),
                "BST order violated on the right"
            );
            assert!(
                self.nodes[r].span.size() <= node.span.size(),
                "heap order violated on the right"
            );
            self.check_subtree(r, inorder);
        }
    }
}
