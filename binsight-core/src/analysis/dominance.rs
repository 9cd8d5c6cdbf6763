//! Dominance Analysis
//!
//! Immediate dominators and post-dominators of every basic block, computed
//! with the iterative algorithm of Cooper, Harvey and Kennedy ("A Simple,
//! Fast Dominance Algorithm").
//!
//! # Algorithm
//! 1. Order the reachable blocks in reverse postorder from the function
//!    entry (resp. a virtual exit for post-dominance).
//! 2. Initialize `dom[entry] = entry`, everything else undefined.
//! 3. Iterate to a fixed point: for every non-entry block in reverse
//!    postorder, intersect the dominators of its processed predecessors with
//!    the two-finger walk over postorder indices.
//! 4. Materialize the tree: each block becomes a child of its immediate
//!    dominator. Padding blocks are skipped.
//!
//! Post-dominance runs the same computation on the reversed CFG, rooted at a
//! virtual exit node linked from every block without successors; the virtual
//! node is torn down afterwards and the blocks it dominated become roots.

use std::collections::HashSet;

use crate::program::block::BlockId;
use crate::program::function::FunctionId;
use crate::program::{AnalyzeFlags, Program};

/// Dominance analyzer.
pub struct DominanceAnalyzer;

impl DominanceAnalyzer {
    /// Builds the dominance tree of every function. Requires `CFG`;
    /// idempotent through the `DOMINANCE` flag.
    pub fn analyze(program: &mut Program) {
        if !program.analyze_flags.contains(AnalyzeFlags::CFG) {
            return;
        }
        if program.analyze_flags.contains(AnalyzeFlags::DOMINANCE) {
            return;
        }
        log::debug!("computing domination");
        for f in 0..program.functions.len() {
            let f = FunctionId(f as u32);
            if !program.function(f).dead {
                Self::compute(program, f, false);
            }
        }
        program.analyze_flags |= AnalyzeFlags::DOMINANCE;
    }

    /// Builds the post-dominance tree of every function. Requires `CFG`;
    /// idempotent through the `POST_DOMINANCE` flag.
    pub fn analyze_post(program: &mut Program) {
        if !program.analyze_flags.contains(AnalyzeFlags::CFG) {
            return;
        }
        if program.analyze_flags.contains(AnalyzeFlags::POST_DOMINANCE) {
            return;
        }
        log::debug!("computing post-domination");
        for f in 0..program.functions.len() {
            let f = FunctionId(f as u32);
            if program.function(f).dead {
                continue;
            }
            Self::add_virtual_exit(program, f);
            Self::compute(program, f, true);
            Self::remove_virtual_exit(program, f);
        }
        program.analyze_flags |= AnalyzeFlags::POST_DOMINANCE;
    }

    /// Creates the virtual exit block and links every block without
    /// successors to it.
    fn add_virtual_exit(program: &mut Program, function: FunctionId) {
        let vn = program.new_virtual_block(function);
        program.function_mut(function).virtual_exit = Some(vn);
        let blocks = program.function(function).blocks.clone();
        for b in blocks {
            if b == vn || program.block_is_padding(b) {
                continue;
            }
            let node = program.block(b).cfg_node;
            if program.cfg.out_edges(node).is_empty() {
                let to = program.block(vn).cfg_node;
                program.cfg.add_edge(node, to, None);
            }
        }
    }

    /// Tears the virtual exit down; its children in the post-dominance tree
    /// become roots.
    fn remove_virtual_exit(program: &mut Program, function: FunctionId) {
        let vn = match program.function_mut(function).virtual_exit.take() {
            Some(vn) => vn,
            None => return,
        };
        let node = program.block(vn).cfg_node;
        let edges: Vec<_> = program.cfg.in_edges(node).to_vec();
        for e in edges {
            program.cfg.remove_edge(e);
        }
        program.function_mut(function).blocks.retain(|&b| b != vn);
        let children = std::mem::take(&mut program.block_mut(vn).pdom_children);
        for c in children {
            program.block_mut(c).ipdom = None;
        }
    }

    /// Shared dominator computation. With `post` the CFG is walked
    /// backwards from the virtual exit.
    fn compute(program: &mut Program, function: FunctionId, post: bool) {
        program.renumber_blocks(function);
        let blocks = program.function(function).blocks.clone();
        let nb_blocks = blocks.len();
        if nb_blocks == 0 {
            return;
        }
        for &b in &blocks {
            let block = program.block_mut(b);
            if post {
                block.ipdom = None;
                block.pdom_children.clear();
            } else {
                block.idom = None;
                block.dom_children.clear();
            }
        }

        let start = if post {
            match program.function(function).virtual_exit {
                Some(vn) => vn,
                None => return,
            }
        } else {
            match program.function(function).entry_block() {
                Some(b) => b,
                None => return,
            }
        };

        // Reverse postorder over the reachable blocks of this function.
        let mut postorder: Vec<BlockId> = Vec::new();
        {
            let mut marks: HashSet<crate::graph::NodeId> = HashSet::new();
            let cfg = &program.cfg;
            let blocks_arena = &program.blocks;
            let mut collect = |n: crate::graph::NodeId| {
                let b = cfg.node(n).data;
                if blocks_arena[b.0 as usize].function == function {
                    postorder.push(b);
                }
            };
            let root = program.block(start).cfg_node;
            if post {
                cfg.back_dfs(root, &mut marks, &mut |_| {}, &mut collect);
            } else {
                cfg.dfs(root, &mut marks, &mut |_| {}, &mut collect);
            }
        }
        let mut postorder_index: Vec<Option<usize>> = vec![None; nb_blocks];
        for (i, &b) in postorder.iter().enumerate() {
            postorder_index[program.block(b).id as usize] = Some(i);
        }
        let reverse_postorder: Vec<BlockId> = postorder.iter().rev().copied().collect();

        let mut doms: Vec<Option<BlockId>> = vec![None; nb_blocks];
        doms[program.block(start).id as usize] = Some(start);

        let mut changed = true;
        while changed {
            changed = false;
            for &b in &reverse_postorder {
                if b == start {
                    continue;
                }
                let node = program.block(b).cfg_node;
                let neighbours: Vec<BlockId> = if post {
                    program
                        .cfg
                        .successors(node)
                        .map(|n| program.cfg.node(n).data)
                        .filter(|&p| program.block(p).function == function)
                        .collect()
                } else {
                    program
                        .cfg
                        .predecessors(node)
                        .map(|n| program.cfg.node(n).data)
                        .filter(|&p| program.block(p).function == function)
                        .collect()
                };

                let mut new_idom: Option<BlockId> = None;
                for &p in &neighbours {
                    if doms[program.block(p).id as usize].is_some() {
                        new_idom = Some(p);
                        break;
                    }
                }
                let first = new_idom;
                for &p in &neighbours {
                    if Some(p) != first && doms[program.block(p).id as usize].is_some() {
                        if let Some(cur) = new_idom {
                            new_idom =
                                Some(Self::intersect(program, p, cur, &doms, &postorder_index));
                        }
                    }
                }
                let slot = program.block(b).id as usize;
                if doms[slot] != new_idom {
                    doms[slot] = new_idom;
                    changed = true;
                }
            }
        }

        // Materialize the tree.
        for &b in &blocks {
            if program.block_is_padding(b) {
                continue;
            }
            let idom = doms[program.block(b).id as usize];
            match idom {
                Some(d) if d != b => {
                    if post {
                        program.block_mut(b).ipdom = Some(d);
                        program.block_mut(d).pdom_children.push(b);
                    } else {
                        program.block_mut(b).idom = Some(d);
                        program.block_mut(d).dom_children.push(b);
                    }
                }
                _ => {}
            }
        }
    }

    /// Two-finger intersection over postorder indices.
    fn intersect(
        program: &Program,
        b1: BlockId,
        b2: BlockId,
        doms: &[Option<BlockId>],
        postorder_index: &[Option<usize>],
    ) -> BlockId {
        let index = |b: BlockId| postorder_index[program.block(b).id as usize].unwrap_or(0);
        let mut finger1 = b1;
        let mut finger2 = b2;
        while index(finger1) != index(finger2) {
            while index(finger1) < index(finger2) {
                match doms[program.block(finger1).id as usize] {
                    Some(d) => finger1 = d,
                    None => return finger2,
                }
            }
            while index(finger2) < index(finger1) {
                match doms[program.block(finger2).id as usize] {
                    Some(d) => finger2 = d,
                    None => return finger1,
                }
            }
        }
        finger1
    }
}

/// True when `a` dominates `b` (reflexive).
pub fn dominates(program: &Program, a: BlockId, b: BlockId) -> bool {
    let mut cur = Some(b);
    while let Some(c) = cur {
        if c == a {
            return true;
        }
        cur = program.block(c).idom;
    }
    false
}
