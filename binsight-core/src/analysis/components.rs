//! Connected Components Analysis
//!
//! Labels the weakly connected components of every function CFG, based on
//! the DFS scheme of Tarjan ("Efficient Algorithms for Graph Manipulation",
//! 1972), modified to record all entries of a component.
//!
//! A block is a component entry when it has no predecessor worth following:
//! every incoming edge comes from a virtual block, a padding block, or is a
//! back-edge of its own loop (which is why this stage runs after loop
//! analysis). Starting from each entry the CFG is traversed along both
//! successors and predecessors; when a traversal reaches a block already
//! owned by another component the two are merged, the surviving component
//! collecting both entry lists. Entries end up sorted by first-instruction
//! address, the component of the function's first instruction first.
//!
//! The module also hosts the *init heads* collection used as seeds by loop
//! analysis: a cheaper marking DFS run before components exist, with the
//! same smallest-address-first tie-break.

use std::collections::HashSet;

use crate::graph::NodeId;
use crate::program::block::BlockId;
use crate::program::function::FunctionId;
use crate::program::{AnalyzeFlags, Program};

/// Connected-components analyzer.
pub struct ComponentAnalyzer;

impl ComponentAnalyzer {
    /// Computes the connected components of every function. Requires `CFG`
    /// (and meaningful results require `LOOPS` for the back-edge test);
    /// idempotent through the `COMPONENTS` flag.
    pub fn analyze(program: &mut Program) {
        if !program.analyze_flags.contains(AnalyzeFlags::CFG) {
            return;
        }
        if program.analyze_flags.contains(AnalyzeFlags::COMPONENTS) {
            return;
        }
        log::debug!("computing connected components");

        for f in 0..program.functions.len() {
            let f = FunctionId(f as u32);
            if program.function(f).dead || program.function(f).components.is_some() {
                continue;
            }
            Self::analyze_function(program, f);
        }
        program.analyze_flags |= AnalyzeFlags::COMPONENTS;
    }

    fn analyze_function(program: &mut Program, function: FunctionId) {
        program.renumber_blocks(function);
        let entry_block = match program.function(function).entry_block() {
            Some(b) => b,
            None => {
                program.function_mut(function).components = Some(Vec::new());
                return;
            }
        };

        // Collect component entries, the function entry first.
        let mut components: Vec<Vec<BlockId>> = Vec::new();
        for &b in &program.function(function).blocks {
            if b == entry_block || Self::is_cc_entry(program, b) {
                if b == entry_block {
                    components.insert(0, vec![b]);
                } else {
                    components.push(vec![b]);
                }
            }
        }

        // Merge components sharing blocks.
        if components.len() > 1 {
            let nb_blocks = program.function(function).blocks.len();
            let mut owner: Vec<Option<usize>> = vec![None; nb_blocks];
            let mut to_remove: Vec<usize> = Vec::new();
            let mut marks: HashSet<NodeId> = HashSet::new();

            for pos in 0..components.len() {
                let head = components[pos][0];
                marks.clear();
                let mut reached: Vec<BlockId> = Vec::new();
                Self::traverse_undirected(
                    program,
                    program.block(head).cfg_node,
                    &mut marks,
                    &mut reached,
                );
                for b in reached {
                    let slot = program.block(b).id as usize;
                    match owner[slot] {
                        None => owner[slot] = Some(pos),
                        Some(other) if other != pos => {
                            // Merged: the other component gains this entry.
                            let entry = components[pos][0];
                            if !components[other].contains(&entry) {
                                components[other].push(entry);
                            }
                            if !to_remove.contains(&pos) {
                                to_remove.push(pos);
                            }
                        }
                        Some(_) => {}
                    }
                }
            }

            to_remove.sort_unstable_by(|a, b| b.cmp(a));
            for pos in to_remove {
                components.remove(pos);
            }
        }

        // Entries in address order, smallest first.
        for cc in &mut components {
            cc.sort_by_key(|&b| program.block_address(b));
        }

        program.function_mut(function).components = Some(components);
    }

    /// Component entry: no non-virtual, non-padding predecessor reached
    /// through a non-back-edge.
    fn is_cc_entry(program: &Program, b: BlockId) -> bool {
        if program.block(b).is_virtual || program.block_is_padding(b) {
            return false;
        }
        let node = program.block(b).cfg_node;
        for &e in program.cfg.in_edges(node) {
            let pred = program.cfg.node(program.cfg.edge(e).from).data;
            if !program.block(pred).is_virtual
                && !program.block_is_padding(pred)
                && !Self::is_back_edge(program, pred, b)
            {
                return false;
            }
        }
        true
    }

    /// Edge `from → to` is a back-edge when both ends share a loop and `to`
    /// is one of its entries.
    fn is_back_edge(program: &Program, from: BlockId, to: BlockId) -> bool {
        match (program.block(from).loop_, program.block(to).loop_) {
            (Some(lf), Some(lt)) if lf == lt => program.loop_(lf).entries.contains(&to),
            _ => false,
        }
    }

    /// Traversal along successors and predecessors, virtual blocks excluded.
    fn traverse_undirected(
        program: &Program,
        node: NodeId,
        marks: &mut HashSet<NodeId>,
        reached: &mut Vec<BlockId>,
    ) {
        if !marks.insert(node) {
            return;
        }
        reached.push(program.cfg.node(node).data);
        let mut neighbours: Vec<NodeId> = Vec::new();
        neighbours.extend(program.cfg.predecessors(node));
        neighbours.extend(program.cfg.successors(node));
        for n in neighbours {
            let b = program.cfg.node(n).data;
            if !program.block(b).is_virtual {
                Self::traverse_undirected(program, n, marks, reached);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Init heads: component seeds for loop analysis

/// Traversal marks of the init-heads DFS.
const UNSEEN: u8 = 0;
const SEEN: u8 = 1;
const HEAD_WITH_PREDS: u8 = 2;
const HEAD_NO_PREDS: u8 = 3;

/// Collects the initial heads of the connected components of `function`.
///
/// A function may contain several components (OpenMP outlining is the usual
/// culprit); loop analysis needs one DFS root per component *before* the
/// component analysis itself can run. Each block without a mark starts a
/// head; the marking DFS demotes heads that turn out reachable, keeping the
/// block with the smallest first-instruction address as the component head.
pub fn collect_init_heads(program: &mut Program, function: FunctionId) -> Vec<BlockId> {
    program.renumber_blocks(function);
    log::debug!(
        "collecting connected component heads in function {}",
        program.function_name(function)
    );
    let nb_blocks = program.function(function).blocks.len();
    let mut marks: Vec<u8> = vec![UNSEEN; nb_blocks];
    let mut heads: Vec<BlockId> = Vec::new();

    for &b in &program.function(function).blocks.clone() {
        if program.block(b).is_virtual {
            continue;
        }
        let slot = program.block(b).id as usize;
        if marks[slot] != UNSEEN {
            continue;
        }
        marks[slot] = if program.cfg.in_edges(program.block(b).cfg_node).is_empty() {
            HEAD_NO_PREDS
        } else {
            HEAD_WITH_PREDS
        };
        heads.insert(0, b);
        mark_dfs(program, b, &mut marks, b, &mut heads);
    }
    heads
}

fn mark_dfs(
    program: &Program,
    root: BlockId,
    marks: &mut Vec<u8>,
    mut default_head: BlockId,
    heads: &mut Vec<BlockId>,
) {
    let succs: Vec<BlockId> = program
        .cfg
        .successors(program.block(root).cfg_node)
        .map(|n| program.cfg.node(n).data)
        .collect();
    for b in succs {
        let slot = program.block(b).id as usize;
        let head_slot = program.block(default_head).id as usize;
        if marks[slot] == UNSEEN || (marks[head_slot] == HEAD_WITH_PREDS && marks[slot] == HEAD_WITH_PREDS)
        {
            if program.block(b).is_virtual {
                continue;
            }
            let not_visited = marks[slot] == UNSEEN;

            // Keep the block with the smallest address as component head.
            if program.block_address(b) < program.block_address(default_head) {
                heads.retain(|&h| h != default_head);
                marks[head_slot] = SEEN;
                heads.insert(0, b);
                default_head = b;
                marks[slot] = HEAD_WITH_PREDS;
            } else {
                marks[slot] = SEEN;
            }

            if not_visited {
                mark_dfs(program, b, marks, default_head, heads);
            }
        } else if marks[head_slot] == HEAD_NO_PREDS && marks[slot] == HEAD_WITH_PREDS {
            // Reachable from a true head: not a component head after all.
            heads.retain(|&h| h != b);
            marks[slot] = SEEN;
        }
    }
}
