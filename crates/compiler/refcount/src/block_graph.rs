//! An optimized representation of the function's block graph, since the
//! fixpoint deals with it a lot: blocks are numbered in layout order and
//! adjacency is integer index lists, so the analysis never walks the IR
//! while reconsidering a block.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use bitvec::bitvec;
use bitvec::vec::BitVec;
use pylon_collections::MutMap;
use pylon_error_macros::internal_error;
use pylon_ir::{BlockId, Function};

pub(crate) struct BlockGraph {
    pub(crate) blocks: Vec<BlockId>,
    /// One entry per incoming edge, in layout order of the source blocks.
    pub(crate) predecessors: Vec<Vec<usize>>,
    /// One entry per outgoing edge, in terminator operand order.
    pub(crate) successors: Vec<Vec<usize>>,
}

impl BlockGraph {
    pub(crate) fn new(func: &Function) -> Self {
        let blocks: Vec<BlockId> = func.layout().to_vec();
        let num_blocks = blocks.len();

        let mut idx_of = MutMap::default();
        for (idx, &block) in blocks.iter().enumerate() {
            idx_of.insert(block, idx);
        }

        let mut predecessors = vec![Vec::new(); num_blocks];
        let mut successors = vec![Vec::new(); num_blocks];
        for (idx, &block) in blocks.iter().enumerate() {
            for succ in func.successors(block) {
                let sidx = idx_of[&succ];
                successors[idx].push(sidx);
                predecessors[sidx].push(idx);
            }
        }

        BlockGraph {
            blocks,
            predecessors,
            successors,
        }
    }

    pub(crate) fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}

/// Computes the order in which a backward analysis wants to first see the
/// blocks: exit blocks first, then any block all of whose successors are
/// already ordered. When that stalls we are looking at a cycle; the
/// heuristic then considers the unordered blocks with ordered successors,
/// most-ordered-successors first, floods each one's successor closure, and
/// appends the last candidate no earlier candidate could reach (a block in
/// the zero-successor component of the SCC).
pub(crate) fn compute_traversal_order(graph: &BlockGraph) -> Vec<usize> {
    let num_blocks = graph.num_blocks();

    let mut ordering: Vec<usize> = Vec::with_capacity(num_blocks);
    let mut added: BitVec = bitvec![0; num_blocks];
    let mut num_successors_added = vec![0usize; num_blocks];

    for idx in 0..num_blocks {
        if graph.successors[idx].is_empty() {
            ordering.push(idx);
            added.set(idx, true);
        }
    }

    let mut check_predecessors_idx = 0;
    while ordering.len() < num_blocks {
        if check_predecessors_idx < ordering.len() {
            // Case 1: look for any blocks whose successors have already been
            // traversed.
            let idx = ordering[check_predecessors_idx];
            check_predecessors_idx += 1;

            for &pidx in &graph.predecessors[idx] {
                if added[pidx] {
                    continue;
                }

                num_successors_added[pidx] += 1;
                if num_successors_added[pidx] == graph.successors[pidx].len() {
                    ordering.push(pidx);
                    added.set(pidx, true);
                }
            }
        } else {
            // Case 2: we hit a cycle. Try to pick a good node to add.
            let mut candidates: Vec<(usize, usize)> = (0..num_blocks)
                .filter(|&idx| num_successors_added[idx] != 0 && !added[idx])
                .map(|idx| (idx, num_successors_added[idx]))
                .collect();
            candidates.sort_by(|lhs, rhs| rhs.1.cmp(&lhs.1));

            let mut visit_queue: VecDeque<usize> = VecDeque::new();
            let mut visited: BitVec = bitvec![0; num_blocks];
            let mut best = None;

            for (candidate, _) in candidates {
                if visited[candidate] {
                    continue;
                }

                best = Some(candidate);
                visit_queue.push_back(candidate);
                visited.set(candidate, true);

                while let Some(idx) = visit_queue.pop_front() {
                    for &sidx in &graph.successors[idx] {
                        if !visited[sidx] {
                            visited.set(sidx, true);
                            visit_queue.push_back(sidx);
                        }
                    }
                }
            }

            // This trips if the IR has an infinite loop in it. That could be
            // supported, but we should not be generating those cases anyway.
            let best = match best {
                Some(best) => best,
                None => internal_error!("traversal order stalled on an unreachable cycle"),
            };
            ordering.push(best);
            added.set(best, true);
        }
    }

    if ordering.len() != num_blocks {
        internal_error!(
            "traversal order covered {} of {} blocks",
            ordering.len(),
            num_blocks
        );
    }
    ordering
}

/// Work queue for the fixpoint: pops blocks in traversal-rank order,
/// re-adding an already-queued block is a no-op.
pub(crate) struct BlockOrderer {
    /// block index -> rank; lower pops first.
    priority: Vec<usize>,
    in_queue: BitVec,
    queue: BinaryHeap<Reverse<(usize, usize)>>,
}

impl BlockOrderer {
    pub(crate) fn new(order: Vec<usize>) -> Self {
        let mut priority = vec![0; order.len()];
        for (rank, &idx) in order.iter().enumerate() {
            priority[idx] = rank;
        }

        BlockOrderer {
            in_queue: bitvec![0; priority.len()],
            queue: BinaryHeap::new(),
            priority,
        }
    }

    pub(crate) fn add(&mut self, idx: usize) {
        if self.in_queue[idx] {
            return;
        }
        self.in_queue.set(idx, true);
        self.queue.push(Reverse((self.priority[idx], idx)));
    }

    pub(crate) fn pop(&mut self) -> Option<usize> {
        let Reverse((_, idx)) = self.queue.pop()?;
        debug_assert!(self.in_queue[idx]);
        self.in_queue.set(idx, false);
        Some(idx)
    }
}
