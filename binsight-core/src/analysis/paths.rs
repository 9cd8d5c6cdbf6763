//! Paths Analysis
//!
//! Enumerates the acyclic execution paths of a function or of a loop body.
//! A path is an ordered array of blocks. Objects with several entries are
//! not considered, and the enumeration is aborted above [`MAX_PATHS`] paths
//! (some loops contain enough paths to exhaust memory): in that case nothing
//! is stored and the caller is told, which is distinct from "computed and
//! empty".
//!
//! For a loop, the CFG is temporarily reduced to the loop subgraph: edges
//! entering the entry block from outside the loop and edges leaving the exit
//! blocks are removed (and snapshotted), the enumeration runs, and the edges
//! are restored.

use crate::graph::NodeId;
use crate::program::block::BlockId;
use crate::program::function::{FunctionId, LoopId};
use crate::program::insn::InsnId;
use crate::program::Program;

/// Maximum number of paths computed on a function or a loop.
pub const MAX_PATHS: usize = 100_000;

/// Result of a path computation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathsOutcome {
    /// Paths computed and stored.
    Computed(usize),
    /// A previous call already stored the paths.
    AlreadyComputed,
    /// Above the cap: nothing stored.
    TooManyPaths,
    /// Functions/loops with several entries are not considered.
    MultipleEntries,
}

/// Computes the paths of a function and stores them in its `paths` field.
pub fn compute_function_paths(program: &mut Program, function: FunctionId) -> PathsOutcome {
    if program.entry_blocks(function).len() != 1 {
        return PathsOutcome::MultipleEntries;
    }
    if program.function(function).paths.is_some() {
        return PathsOutcome::AlreadyComputed;
    }
    let root = match program.function(function).entry_block() {
        Some(b) => b,
        None => return PathsOutcome::MultipleEntries,
    };
    match enumerate_block_paths(program, root, MAX_PATHS) {
        Some(paths) => {
            let n = paths.len();
            program.function_mut(function).paths = Some(paths);
            PathsOutcome::Computed(n)
        }
        None => PathsOutcome::TooManyPaths,
    }
}

/// Computes the paths of a loop over its body subgraph.
pub fn compute_loop_paths(program: &mut Program, l: LoopId) -> PathsOutcome {
    if program.loop_(l).body_entries().count() != 1 {
        return PathsOutcome::MultipleEntries;
    }
    if program.loop_(l).paths.is_some() {
        return PathsOutcome::AlreadyComputed;
    }
    let root = program.loop_(l).header();

    let removed = remove_edges_for_subgraph(program, l);
    let outcome = match enumerate_block_paths(program, root, MAX_PATHS) {
        Some(paths) => {
            let n = paths.len();
            program.loop_mut(l).paths = Some(paths);
            PathsOutcome::Computed(n)
        }
        None => PathsOutcome::TooManyPaths,
    };
    restore_edges(program, removed);
    outcome
}

/// Number of paths of a function, without storing them. `None` when the
/// function has several entries.
pub fn function_path_count(program: &Program, function: FunctionId) -> Option<usize> {
    let entries = program.entry_blocks(function);
    if entries.len() != 1 {
        log::debug!("function has {} entries", entries.len());
        return None;
    }
    let root = program.block(entries[0]).cfg_node;
    Some(program.cfg.count_paths(root, usize::MAX))
}

/// Number of paths of a loop, without storing them. `None` when the loop
/// has several entries.
pub fn loop_path_count(program: &mut Program, l: LoopId) -> Option<usize> {
    if program.loop_(l).body_entries().count() != 1 {
        return None;
    }
    let removed = remove_edges_for_subgraph(program, l);
    let root = program.block(program.loop_(l).header()).cfg_node;
    let count = program.cfg.count_paths(root, usize::MAX);
    restore_edges(program, removed);
    Some(count)
}

/// Releases the paths of a function.
pub fn free_function_paths(program: &mut Program, function: FunctionId) {
    program.function_mut(function).paths = None;
}

/// Releases the paths of a loop.
pub fn free_loop_paths(program: &mut Program, l: LoopId) {
    program.loop_mut(l).paths = None;
}

/// Enumerates the paths rooted at `root`, as block arrays. `None` above
/// `max` paths.
fn enumerate_block_paths(
    program: &Program,
    root: BlockId,
    max: usize,
) -> Option<Vec<Vec<BlockId>>> {
    let root_node = program.block(root).cfg_node;

    // A count equal to max + 1 means "more than max".
    let npaths = program.cfg.count_paths(root_node, max + 1);
    if npaths > max {
        return None;
    }

    let mut paths: Vec<Vec<BlockId>> = Vec::with_capacity(npaths);
    let cfg = &program.cfg;
    let mut collect = |nodes: &[NodeId]| {
        paths.push(nodes.iter().map(|&n| cfg.node(n).data).collect());
    };
    cfg.enumerate_paths(root_node, max, &mut collect);
    Some(paths)
}

/// Snapshot of one removed CFG edge.
struct RemovedEdge {
    from: NodeId,
    to: NodeId,
    data: Option<InsnId>,
}

/// Removes the edges entering the loop entry from outside and the edges
/// leaving its exit blocks, returning them for restoration.
fn remove_edges_for_subgraph(program: &mut Program, l: LoopId) -> Vec<RemovedEdge> {
    let root = program.loop_(l).header();
    let root_node = program.block(root).cfg_node;
    let mut doomed = Vec::new();

    for &e in program.cfg.in_edges(root_node) {
        let from_block = program.cfg.node(program.cfg.edge(e).from).data;
        if program.block(from_block).loop_ != Some(l) {
            doomed.push(e);
        }
    }
    for &exit in program.loop_(l).exits.clone().iter() {
        let exit_node = program.block(exit).cfg_node;
        for &e in program.cfg.out_edges(exit_node) {
            let to_block = program.cfg.node(program.cfg.edge(e).to).data;
            if program.block(to_block).loop_ != Some(l) {
                doomed.push(e);
            }
        }
    }

    let mut removed = Vec::with_capacity(doomed.len());
    for e in doomed {
        let edge = program.cfg.edge(e);
        removed.push(RemovedEdge {
            from: edge.from,
            to: edge.to,
            data: edge.data,
        });
        program.cfg.remove_edge(e);
    }
    removed
}

/// Restores the edges removed by [`remove_edges_for_subgraph`].
fn restore_edges(program: &mut Program, removed: Vec<RemovedEdge>) {
    for e in removed {
        program.cfg.add_edge(e.from, e.to, e.data);
    }
}
