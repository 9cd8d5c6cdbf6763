//! Loop Analysis
//!
//! Loop identification and loop-nesting forest construction in a single DFS
//! traversal, after Wei, Mao, Zou and Chen ("A New Algorithm for Identifying
//! Loops in Decompilation"). The variant here additionally handles re-entry
//! edges (irreducible regions) and keeps the loop hierarchy consistent when
//! overlapping unstructuredness is discovered, by reordering the nest so the
//! loop with the earliest header stays outermost.
//!
//! # State
//! Per block: a DFS number (`dfn`, positive while the block is on the active
//! DFS path), a traversed flag, and the innermost loop owning the block. A
//! global block stack accumulates the blocks of the loop being closed: when
//! the DFS returns to a block that is the sole entry of its loop, the stack
//! is unwound and the loop absorbs its blocks, inner loops being absorbed
//! en masse through their entry block.
//!
//! Exits are marked during absorption: a block with an edge leaving the
//! current nest is an exit, and so is a block calling one of the project
//! exit functions.
//!
//! Two fixups run after the main analysis: virtual-entry functions get an
//! edge from their entry to loops forming orphan components, and loops gain
//! the outside predecessor entries the traversal order hid from them.

use crate::program::block::BlockId;
use crate::program::function::{FunctionId, LoopId};
use crate::program::insn::Annotations;
use crate::program::{AnalyzeFlags, Program};

/// Per-function traversal state.
struct LoopState {
    /// DFS number per block id; positive while on the active DFS path.
    dfn: Vec<i64>,
    traversed: Vec<bool>,
    /// Global DFS stack; `None` marks removed entries.
    bstack: Vec<Option<BlockId>>,
    next_dfn: i64,
}

impl LoopState {
    fn dfn(&self, program: &Program, b: BlockId) -> i64 {
        self.dfn[program.block(b).id as usize]
    }
}

/// Loop analyzer.
pub struct LoopAnalyzer;

impl LoopAnalyzer {
    /// Identifies loops and builds the nesting forest of every function.
    /// Requires `CFG`; idempotent through the `LOOPS` flag.
    pub fn analyze(program: &mut Program) {
        if !program.analyze_flags.contains(AnalyzeFlags::CFG) {
            log::warn!("control flow should be analyzed before computing loops");
            return;
        }
        if program.analyze_flags.contains(AnalyzeFlags::LOOPS) {
            return;
        }
        log::debug!("computing loops");
        for f in 0..program.functions.len() {
            let f = FunctionId(f as u32);
            if program.function(f).dead {
                continue;
            }
            log::debug!("analyzing loops of function {}", program.function_name(f));
            Self::build_loops(program, f);
        }
        program.analyze_flags |= AnalyzeFlags::LOOPS;

        // An independent loop is sometimes not recognized as a component.
        Self::attach_orphan_components(program);
        Self::fix_loop_entries(program);
    }

    fn build_loops(program: &mut Program, function: FunctionId) {
        let heads = crate::analysis::components::collect_init_heads(program, function);
        let nb_blocks = program.function(function).blocks.len();
        if nb_blocks == 0 {
            return;
        }
        let mut state = LoopState {
            dfn: vec![0; nb_blocks + 1],
            traversed: vec![false; nb_blocks + 1],
            bstack: Vec::new(),
            next_dfn: 0,
        };

        let mut valid = false;
        for root in heads {
            valid = true;
            log::debug!("building loops starting from block {}", program.block(root).id);
            Self::constructor(program, root, &mut state);
        }
        if !valid {
            log::warn!(
                "function {} has no component head",
                program.function_name(function)
            );
        }
    }

    /// The recursive loop constructor. Returns the position holder of the
    /// root's loop: the entry of its outermost enclosing structure.
    fn constructor(program: &mut Program, root: BlockId, state: &mut LoopState) -> Option<BlockId> {
        state.bstack.push(Some(root));
        state.next_dfn += 1;
        let slot = program.block(root).id as usize;
        state.dfn[slot] = state.next_dfn;
        state.traversed[slot] = true;

        // Successors visited in edge insertion order, keeping the traversal
        // deterministic over reruns.
        let succs: Vec<BlockId> = program
            .cfg
            .successors(program.block(root).cfg_node)
            .map(|n| program.cfg.node(n).data)
            .collect();
        for &b in succs.iter() {
            let b_slot = program.block(b).id as usize;
            if !state.traversed[b_slot] {
                // New block: recurse.
                let nh = Self::constructor(program, b, state);
                Self::reorder_hierarchy(program, state, root, nh);
            } else if state.dfn[b_slot] > 0 {
                // On the active DFS path: b is a loop header.
                let needs_loop = match program.block(b).loop_ {
                    None => true,
                    Some(l) => program.loop_(l).header() != b,
                };
                if needs_loop {
                    let l = program.new_loop(program.block(b).function, b);
                    log::debug!(
                        "created new loop {} with block {} as header",
                        program.loop_(l).id,
                        program.block(b).id
                    );
                }
                Self::reorder_hierarchy(program, state, root, Some(b));
            } else if let Some(bl) = program.block(b).loop_ {
                let is_header = program.loop_(bl).header() == b;
                let parent = program.loop_(bl).parent;
                if !is_header || parent.is_some() {
                    // Closed block inside a loop: find its position holder.
                    let h = match (is_header, parent) {
                        (false, _) => program.loop_(bl).header(),
                        (true, Some(p)) => program.loop_(p).header(),
                        (true, None) => continue,
                    };
                    log::debug!(
                        "block {} belongs to loop {}, position holder is {}",
                        program.block(b).id,
                        program.loop_(bl).id,
                        program.block(h).id
                    );
                    if state.dfn(program, h) > 0 {
                        Self::reorder_hierarchy(program, state, root, Some(h));
                    } else {
                        // h is not on the DFS path: b is a re-entry.
                        let hl = program.block(h).loop_;
                        if let Some(hl) = hl {
                            if !program.loop_(hl).entries.contains(&b) {
                                program.loop_mut(hl).entries.insert(1, b);
                            }
                            log::debug!(
                                "block {} is a re-entry for loop {}",
                                program.block(b).id,
                                program.loop_(hl).id
                            );
                            let mut llp = program.loop_(hl).parent;
                            while let Some(lp) = llp {
                                let lp_header = program.loop_(lp).header();
                                if state.dfn(program, lp_header) > 0 {
                                    Self::reorder_hierarchy(program, state, root, Some(lp_header));
                                    break;
                                }
                                if !program.loop_(lp).entries.contains(&b) {
                                    program.loop_mut(lp).entries.insert(1, b);
                                }
                                llp = program.loop_(lp).parent;
                            }
                        }
                    }
                }
            }
        }

        let root_loop = match program.block(root).loop_ {
            Some(l) => l,
            None => {
                state.dfn[program.block(root).id as usize] = 0;
                return None;
            }
        };

        if program.loop_(root_loop).header() == root {
            Self::absorb_stack(program, state, root, root_loop);
        }

        state.dfn[program.block(root).id as usize] = 0;
        let root_loop = program.block(root).loop_.unwrap_or(root_loop);
        if program.loop_(root_loop).header() != root {
            return Some(program.loop_(root_loop).header());
        }
        if let Some(parent) = program.loop_(root_loop).parent {
            return Some(program.loop_(parent).header());
        }
        None
    }

    /// Unwinds the DFS stack, the closing loop absorbing its blocks.
    fn absorb_stack(program: &mut Program, state: &mut LoopState, root: BlockId, l: LoopId) {
        let pos = match state.bstack.iter().rposition(|&b| b == Some(root)) {
            Some(p) => p,
            None => return,
        };
        for idx in pos..state.bstack.len() {
            let block = match state.bstack[idx] {
                Some(b) => b,
                None => continue,
            };

            // A call to an exit function ends the iteration as well.
            if Self::calls_exit_function(program, block) {
                Self::mark_exit(program, l, block);
            }

            let block_loop = match program.block(block).loop_ {
                Some(bl) => bl,
                None => continue,
            };
            if block_loop == l {
                // Plain body block: absorb and look for escaping edges.
                program.loop_mut(l).blocks.push(block);
                if block != root {
                    state.bstack[idx] = None;
                }
                let succs: Vec<BlockId> = program
                    .cfg
                    .successors(program.block(block).cfg_node)
                    .map(|n| program.cfg.node(n).data)
                    .collect();
                for b in succs {
                    match program.block(b).loop_ {
                        None => {
                            Self::mark_exit(program, l, block);
                            break;
                        }
                        Some(sl) if sl != l => {
                            if program.loop_(sl).parent.is_some() {
                                if !program.loop_is_ancestor(l, sl) {
                                    Self::mark_exit(program, l, block);
                                    break;
                                }
                            } else {
                                Self::mark_exit(program, l, block);
                            }
                        }
                        Some(_) => {}
                    }
                }
            } else if program.loop_(block_loop).header() == block
                && program.loop_is_ancestor(l, block_loop)
            {
                // Entry of an inner loop: absorb its whole block set.
                let inner_blocks = program.loop_(block_loop).blocks.clone();
                for inner in inner_blocks {
                    program.loop_mut(l).blocks.push(inner);
                    let succs: Vec<BlockId> = program
                        .cfg
                        .successors(program.block(inner).cfg_node)
                        .map(|n| program.cfg.node(n).data)
                        .collect();
                    for b in succs {
                        match program.block(b).loop_ {
                            Some(sl) => {
                                let escapes = sl != l
                                    && ((program.loop_(sl).parent.is_some()
                                        && !program.loop_is_ancestor(l, sl))
                                        || program.loop_(sl).parent.is_none());
                                if escapes {
                                    Self::mark_exit(program, l, inner);
                                    break;
                                }
                            }
                            None => {
                                Self::mark_exit(program, l, inner);
                                break;
                            }
                        }
                    }
                }
                state.bstack[idx] = None;
            }
        }
    }

    fn mark_exit(program: &mut Program, l: LoopId, block: BlockId) {
        if !program.loop_(l).exits.contains(&block) {
            program.loop_mut(l).exits.push(block);
        }
        program.block_mut(block).is_loop_exit = true;
    }

    /// Last instruction is a call to one of the project exit functions.
    fn calls_exit_function(program: &Program, block: BlockId) -> bool {
        if program.exit_functions.is_empty() {
            return false;
        }
        let last = match program.block(block).last_insn() {
            Some(i) => i,
            None => return false,
        };
        let insn = program.insn(last);
        if !insn.has(Annotations::CALL) {
            return false;
        }
        match insn.branch {
            Some(target) => {
                let name = program.label_name(program.insn(target).label);
                program.is_exit_function_name(name)
            }
            None => false,
        }
    }

    /// Reorders the loop-nesting forest after overlapping or irreducible
    /// unstructuredness was discovered, so the loop whose entry comes first
    /// in DFS order becomes the outermost.
    fn reorder_hierarchy(
        program: &mut Program,
        state: &LoopState,
        b: BlockId,
        h: Option<BlockId>,
    ) {
        let h = match h {
            Some(h) if h != b => h,
            _ => return,
        };
        let mut cur1 = b;
        let mut cur2 = h;
        log::debug!(
            "reordering from block {} to block {}",
            program.block(b).id,
            program.block(h).id
        );
        loop {
            let ih = match program.block(cur1).loop_ {
                Some(l1) => {
                    if program.loop_(l1).header() != cur1 {
                        program.loop_(l1).header()
                    } else if let Some(p) = program.loop_(l1).parent {
                        program.loop_(p).header()
                    } else {
                        break;
                    }
                }
                None => break,
            };
            if ih == cur2 {
                return;
            }
            if state.dfn(program, ih) < state.dfn(program, cur2) {
                let (l1, l2) = match (program.block(cur1).loop_, program.block(cur2).loop_) {
                    (Some(l1), Some(l2)) => (l1, l2),
                    _ => return,
                };
                if program.loop_(l1).header() != cur1 {
                    // The block migrates into the earlier loop.
                    log::debug!(
                        "moving block {} from loop {} to loop {}",
                        program.block(cur1).id,
                        program.loop_(l1).id,
                        program.loop_(l2).id
                    );
                    program.block_mut(cur1).loop_ = Some(l2);
                }
                let lih = match program.block(ih).loop_ {
                    Some(l) => l,
                    None => return,
                };
                if lih != l2 {
                    Self::reparent(program, l2, lih);
                    log::debug!(
                        "moving loop {} under loop {}",
                        program.loop_(l2).id,
                        program.loop_(lih).id
                    );
                }
                cur1 = cur2;
                cur2 = ih;
            } else {
                cur1 = ih;
            }
        }

        match program.block(cur1).loop_ {
            None => program.block_mut(cur1).loop_ = program.block(cur2).loop_,
            Some(l1) => {
                if let Some(l2) = program.block(cur2).loop_ {
                    if l1 != l2 && program.loop_(l1).parent.is_none() {
                        Self::reparent(program, l1, l2);
                    }
                }
            }
        }
    }

    /// Moves `child` under `parent` in the nesting forest.
    fn reparent(program: &mut Program, child: LoopId, parent: LoopId) {
        if let Some(old) = program.loop_(child).parent {
            program.loop_mut(old).children.retain(|&c| c != child);
        }
        program.loop_mut(child).parent = Some(parent);
        program.loop_mut(parent).children.push(child);
    }

    // -------------------------------------------------------------------
    // Fixups

    /// For virtual-entry functions, loops whose entry is only reachable from
    /// inside their own nest form an orphan component: attach them to the
    /// function entry with a virtual edge.
    fn attach_orphan_components(program: &mut Program) {
        log::debug!("looking for components not attached to the entry");
        for f in 0..program.functions.len() {
            let f = FunctionId(f as u32);
            if program.function(f).dead {
                continue;
            }
            let entry = match program.function(f).entry_block() {
                Some(b) => b,
                None => continue,
            };
            if !program.block(entry).is_virtual {
                continue;
            }
            let loops = program.function(f).loops.clone();
            'loops: for l in loops {
                let entries = program.loop_(l).entries.clone();
                for b in entries {
                    let node = program.block(b).cfg_node;
                    if program.cfg.in_edges(node).is_empty() {
                        continue;
                    }
                    let mut count = 0usize;
                    let mut linked = 0usize;
                    let mut already_attached = false;
                    let preds: Vec<BlockId> = program
                        .cfg
                        .predecessors(node)
                        .map(|n| program.cfg.node(n).data)
                        .collect();
                    for inblock in preds {
                        count += 1;
                        if program.block(inblock).is_virtual {
                            already_attached = true;
                        } else if inblock != b {
                            let mut hloop = program.block(inblock).loop_;
                            while let Some(hl) = hloop {
                                if Some(hl) != program.block(b).loop_ {
                                    hloop = program.loop_(hl).parent;
                                } else {
                                    linked += 1;
                                    break;
                                }
                            }
                        }
                    }
                    if linked == count && !already_attached {
                        let from = program.block(entry).cfg_node;
                        program.cfg.add_edge(from, node, None);
                        log::debug!(
                            "added edge from {} to {}",
                            program.block(entry).id,
                            program.block(b).id
                        );
                        continue 'loops;
                    }
                }
            }
        }
    }

    /// Adds to each loop's entry list the predecessor blocks lying outside
    /// the loop that the traversal order hid from it.
    fn fix_loop_entries(program: &mut Program) -> usize {
        log::debug!("fixing loop entries");
        let mut added = 0usize;
        for l in 0..program.loops.len() {
            let l = LoopId(l as u32);
            let blocks = program.loop_(l).blocks.clone();
            for &b in &blocks {
                let preds: Vec<BlockId> = program
                    .cfg
                    .predecessors(program.block(b).cfg_node)
                    .map(|n| program.cfg.node(n).data)
                    .collect();
                for pred in preds {
                    if blocks.contains(&pred) {
                        continue;
                    }
                    if !program.loop_(l).entries.contains(&pred) {
                        program.loop_mut(l).entries.push(pred);
                        added += 1;
                    }
                }
            }
        }
        added
    }
}
