//! Control Flow Analysis
//!
//! This module builds the control flow graph (CFG) and the call graph (CG)
//! of a file from its annotated instruction sequence.
//!
//! # Algorithm
//! Two passes over the lexical instruction sequence:
//! 1. **Classification**: tag branch targets with `BEGIN_BLOCK`, detect
//!    function boundaries from label transitions (`BEGIN_PROC`), and flag
//!    calls to exit functions with `HANDLER_EX` so they terminate their
//!    block.
//! 2. **Graph construction**: walk the sequence maintaining the current
//!    function/block/previous instruction, split blocks, link fall-through
//!    and jump edges in the CFG and call edges in the CG.
//!
//! Annotation contract: `RTRN`, `CALL` and `JUMP` are set by the
//! disassembler according to instruction semantics. `CONDITIONAL` must be
//! set when control can also pass to the following instruction. A `CALL` is
//! assumed to return, except when `HANDLER_EX` was derived. `BEGIN_BLOCK`
//! marks branch targets only; instructions following a branch, call or
//! return start a block without carrying the flag.
//!
//! A third phase consolidates patched binaries: blocks materialized in a
//! patch section are *stolen* into the function a CFG neighbour belongs to,
//! leftover cross-function CFG edges are rewritten as CG edges, and padding
//! blocks lose their outgoing edges. Finally the indirect-branch solver runs
//! on every function.

use anyhow::Result;

use crate::error::CoreError;
use crate::program::block::BlockId;
use crate::program::function::FunctionId;
use crate::program::insn::{Annotations, InsnId};
use crate::program::{AnalyzeFlags, LabelKind, Program};

/// Walk state of the graph-construction pass.
struct Current {
    function: Option<FunctionId>,
    block: Option<BlockId>,
    previous: Option<InsnId>,
    /// Patch-section blocks to move into their real function afterwards.
    block_to_move: Vec<BlockId>,
}

/// Control flow analyzer.
pub struct ControlFlowAnalyzer;

impl ControlFlowAnalyzer {
    /// Builds the CFG and CG of the file.
    ///
    /// Requires the `DISASSEMBLED` flag; returns silently when the CFG was
    /// already built. On success sets `CFG`.
    ///
    /// # Errors
    /// `CoreError::BranchOutsideFunction` when a jump or call is found
    /// before any function label, `CoreError::MissingFunctionLabel` when an
    /// instruction cannot be attached to a function. Both abandon the file.
    pub fn analyze(program: &mut Program) -> Result<()> {
        if !program.analyze_flags.contains(AnalyzeFlags::DISASSEMBLED) {
            return Ok(());
        }
        if program.analyze_flags.contains(AnalyzeFlags::CFG) {
            return Ok(());
        }
        log::debug!("computing control flow graph");

        let mut current = Current {
            function: None,
            block: None,
            previous: None,
            block_to_move: Vec::new(),
        };

        for i in 0..program.insns.len() {
            Self::classify_insn(program, InsnId(i as u32), &mut current)?;
        }
        current.function = None;
        current.previous = None;
        for i in 0..program.insns.len() {
            Self::build_graph(program, InsnId(i as u32), &mut current)?;
        }

        if !current.block_to_move.is_empty() {
            Self::consolidate_patches(program, &current.block_to_move);
        }

        log::debug!("indirect branch handling");
        for f in 0..program.functions.len() {
            crate::analysis::indirect_branch::solve_function(program, FunctionId(f as u32));
        }

        // Padding blocks do not transfer control anywhere meaningful.
        for b in 0..program.blocks.len() {
            let b = BlockId(b as u32);
            if program.block_is_padding(b) {
                log::debug!("block {} is a padding block", program.block(b).id);
                let node = program.block(b).cfg_node;
                let out: Vec<_> = program.cfg.out_edges(node).to_vec();
                for e in out {
                    program.cfg.remove_edge(e);
                }
            }
        }

        program.analyze_flags |= AnalyzeFlags::CFG;
        Ok(())
    }

    /// True when the instruction takes part in flow analysis: located in a
    /// code or patched section and not an external-function stub.
    fn in_code(program: &Program, insn: InsnId) -> bool {
        let anno = program.insn(insn).annotations;
        anno.intersects(Annotations::STDCODE | Annotations::PATCHED)
            && !anno.contains(Annotations::EXTFCT)
    }

    /// Classification pass (see module documentation).
    fn classify_insn(program: &mut Program, insn: InsnId, current: &mut Current) -> Result<()> {
        if !Self::in_code(program, insn) {
            return Ok(());
        }
        let anno = program.insn(insn).annotations;

        // A jump target starts a block.
        if anno.contains(Annotations::JUMP) && !anno.contains(Annotations::RTRN) {
            if let Some(target) = program.insn(insn).branch {
                program.insn_mut(target).annotations |= Annotations::BEGIN_BLOCK;
                log::debug!(
                    "branch from 0x{:X} to 0x{:X}",
                    program.insn(insn).address,
                    program.insn(target).address
                );
            }
        }

        // Synthetic new-block labels force a split as well.
        if program.new_block_marks.contains(&insn) {
            program.insn_mut(insn).annotations |= Annotations::BEGIN_BLOCK;
        }

        // Function boundary: the covering label changed.
        let label = program.insn(insn).label;
        let starts_function = match current.function {
            None => true,
            Some(f) => program.function(f).label != label,
        };
        if starts_function {
            let f = match program.function_by_label(label) {
                Some(f) => f,
                None => program.new_function(label, insn),
            };
            log::debug!(
                "found function {} => 0x{:X}",
                program.label_name(label),
                program.insn(insn).address
            );
            current.function = Some(f);
            program.insn_mut(insn).annotations |= Annotations::BEGIN_PROC;
        }

        // Calls to a handler (exit) function never return.
        if anno.contains(Annotations::CALL) {
            if let Some(target) = program.insn(insn).branch {
                let callee = program.label_name(program.insn(target).label).to_string();
                if program.is_exit_function_name(&callee) {
                    log::debug!(
                        "call at 0x{:X} to {} performs an exit: treated as a return",
                        program.insn(insn).address,
                        callee
                    );
                    program.insn_mut(insn).annotations |= Annotations::HANDLER_EX;
                }
            }
        }
        Ok(())
    }

    /// Graph-construction pass (see module documentation).
    fn build_graph(program: &mut Program, insn: InsnId, current: &mut Current) -> Result<()> {
        if !Self::in_code(program, insn) {
            return Ok(());
        }
        let anno = program.insn(insn).annotations;

        // First instruction of a function: also a new block.
        if anno.contains(Annotations::BEGIN_PROC) {
            let label = program.insn(insn).label;
            current.function = program.function_by_label(label);
            current.previous = None;
        }

        let prev_anno = current
            .previous
            .map(|p| program.insn(p).annotations)
            .unwrap_or_default();
        let splits = anno.intersects(Annotations::BEGIN_BLOCK | Annotations::BEGIN_PROC)
            || prev_anno.intersects(Annotations::JUMP | Annotations::RTRN | Annotations::CALL);
        if splits {
            let f = current
                .function
                .ok_or(CoreError::MissingFunctionLabel(program.insn(insn).address))?;
            let b = program.block_starting_at(f, insn);
            if let (Some(prev), Some(cur)) = (current.previous, current.block) {
                let falls_through = !prev_anno.intersects(
                    Annotations::JUMP | Annotations::RTRN | Annotations::HANDLER_EX,
                ) || prev_anno.contains(Annotations::CONDITIONAL);
                if falls_through {
                    let from = program.block(cur).cfg_node;
                    let to = program.block(b).cfg_node;
                    program.cfg.add_edge(from, to, Some(prev));
                } else {
                    log::debug!("no fall-through into block at 0x{:X}", program.insn(insn).address);
                }
            }
            current.block = Some(b);
        }

        // Jump, return and call are exclusive terminator kinds.
        let kind = anno & (Annotations::JUMP | Annotations::RTRN | Annotations::CALL);
        if kind == Annotations::JUMP {
            Self::build_graph_jump(program, insn, current)?;
        } else if kind == Annotations::CALL {
            Self::build_graph_call(program, insn, current)?;
        }

        current.previous = Some(insn);
        if let Some(b) = current.block {
            program.add_insn_to_block(insn, b);
        }
        Ok(())
    }

    fn build_graph_jump(program: &mut Program, insn: InsnId, current: &mut Current) -> Result<()> {
        let function = current
            .function
            .ok_or(CoreError::BranchOutsideFunction(program.insn(insn).address))?;
        let target = match program.insn(insn).branch {
            Some(t) => t,
            None => {
                // Left pending for the indirect-branch solver.
                log::debug!(
                    "unresolved indirect jump at 0x{:X}",
                    program.insn(insn).address
                );
                return Ok(());
            }
        };

        let target_label = program.insn(target).label;
        if program.label_name(target_label) != program.function_name(function) {
            // Jump into another function.
            log::debug!(
                "jumping from function {} to function {}",
                program.function_name(function),
                program.label_name(target_label)
            );
            let f = match program.function_by_label(target_label) {
                Some(f) => f,
                None => {
                    let f = program.new_function(target_label, target);
                    log::debug!("creating function {}", program.label_name(target_label));
                    program.block_starting_at(f, target);
                    f
                }
            };

            let insn_patched = program.insn(insn).has(Annotations::PATCHED)
                && program.label(program.insn(insn).label).kind == LabelKind::PatchSection;
            let target_patched = program.insn(target).has(Annotations::PATCHED)
                && program.label(target_label).kind == LabelKind::PatchSection;
            let trampoline = program.insn(target).has(Annotations::JUMP)
                && program
                    .insn(target)
                    .branch
                    .map(|t2| program.insn(t2).has(Annotations::PATCHED))
                    .unwrap_or(false);

            let cur = current
                .block
                .ok_or(CoreError::BranchOutsideFunction(program.insn(insn).address))?;
            if insn_patched || target_patched {
                // The patched-section block will be moved into its real
                // function afterwards; keep the edge in the CFG for now.
                let b = program.block_starting_at(f, target);
                if target_patched {
                    current.block_to_move.push(b);
                }
                let from = program.block(cur).cfg_node;
                let to = program.block(b).cfg_node;
                program.cfg.add_edge(from, to, Some(insn));
            } else if trampoline {
                log::debug!(
                    "trampoline detected at address 0x{:X}",
                    program.insn(target).address
                );
                let b = program.block_starting_at(f, target);
                current.block_to_move.push(b);
                let from = program.block(cur).cfg_node;
                let to = program.block(b).cfg_node;
                program.cfg.add_edge(from, to, Some(insn));
            } else {
                let from = program.function(function).cg_node;
                let to = program.function(f).cg_node;
                program.cg.add_edge(from, to, ());
            }
        } else {
            // Jump inside the current function.
            let b = program.block_starting_at(function, target);
            log::debug!(
                "setting jump target: block {} in {}",
                program.block(b).id,
                program.function_name(function)
            );
            let cur = current
                .block
                .ok_or(CoreError::BranchOutsideFunction(program.insn(insn).address))?;
            let from = program.block(cur).cfg_node;
            let to = program.block(b).cfg_node;
            program.cfg.add_edge(from, to, Some(insn));
        }
        Ok(())
    }

    fn build_graph_call(program: &mut Program, insn: InsnId, current: &mut Current) -> Result<()> {
        let function = current
            .function
            .ok_or(CoreError::BranchOutsideFunction(program.insn(insn).address))?;
        let target = program.insn(insn).branch;
        match target {
            Some(t) => {
                let label = program.insn(t).label;
                let f = match program.function_by_label(label) {
                    Some(f) => f,
                    None => {
                        let f = program.new_function(label, t);
                        log::debug!("creating function {}", program.label_name(label));
                        program.block_starting_at(f, t);
                        f
                    }
                };
                let from = program.function(function).cg_node;
                let to = program.function(f).cg_node;
                program.cg.add_edge(from, to, ());
            }
            None => {
                log::debug!(
                    "indirect or unreferenced call at 0x{:X} left pending",
                    program.insn(insn).address
                );
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Patched-binary consolidation

    /// Moves every queued patch-section block into its real function, then
    /// sweeps the remaining patch blocks and cross-function edges.
    fn consolidate_patches(program: &mut Program, block_to_move: &[BlockId]) {
        for &b in block_to_move {
            if let Some(stealer) = Self::find_stealing_function(program, b) {
                log::debug!(
                    "block {} (0x{:X}) from function {} must go in function {}",
                    program.block(b).id,
                    program.block_address(b),
                    program.function_name(program.block(b).function),
                    program.function_name(stealer)
                );
                Self::steal_block(program, b, stealer);
            }
        }

        // Remaining blocks of a patch-section function follow the function
        // of the previous lexical instruction.
        let mut patch_fct: Option<FunctionId> = None;
        for f in 0..program.functions.len() {
            let f = FunctionId(f as u32);
            let first = program.function(f).first_insn;
            if program.label(program.insn(first).label).kind != LabelKind::PatchSection {
                continue;
            }
            let mut cursor = Some(first);
            while let Some(i) = cursor {
                if program.label(program.insn(i).label).kind == LabelKind::PatchSection {
                    if let (Some(block), Some(prev)) =
                        (program.insn(i).block, program.prev_insn(i))
                    {
                        if let Some(prev_block) = program.insn(prev).block {
                            let stealer = program.block(prev_block).function;
                            Self::steal_block(program, block, stealer);
                        }
                    }
                }
                cursor = program.next_insn(i);
            }
            patch_fct = Some(f);
        }
        if let Some(f) = patch_fct {
            if program.function(f).blocks.is_empty() {
                // Only discarded when empty: it may keep blocks that could
                // not be stolen.
                program.function_mut(f).dead = true;
            }
        }

        // Some stolen blocks can keep edges crossing function boundaries.
        let mut to_remove = Vec::new();
        for b in 0..program.blocks.len() {
            let block = &program.blocks[b];
            for &e in program.cfg.in_edges(block.cfg_node) {
                let from_block = program.cfg.node(program.cfg.edge(e).from).data;
                if program.block(from_block).function != block.function {
                    to_remove.push(e);
                }
            }
        }
        for e in to_remove {
            log::debug!("edge deleted across function boundary");
            program.cfg.remove_edge(e);
        }
    }

    /// Function of the first CFG neighbour located outside the block's
    /// current (patch) function.
    fn find_stealing_function(program: &Program, b: BlockId) -> Option<FunctionId> {
        let block = program.block(b);
        let node = block.cfg_node;
        for &e in program.cfg.in_edges(node) {
            let src = program.cfg.node(program.cfg.edge(e).from).data;
            if program.block(src).function != block.function {
                return Some(program.block(src).function);
            }
        }
        for &e in program.cfg.out_edges(node) {
            let dst = program.cfg.node(program.cfg.edge(e).to).data;
            if program.block(dst).function != block.function {
                return Some(program.block(dst).function);
            }
        }
        None
    }

    /// Transfers a block into another function.
    fn steal_block(program: &mut Program, b: BlockId, fct: FunctionId) {
        if program.block(b).function == fct {
            return;
        }
        let old = program.block(b).function;
        let new_label = program.function(fct).label;

        if program.function(old).blocks.first() == Some(&b) {
            // The stolen block anchored the function: re-anchor it at the
            // first following instruction outside the block.
            program.function_mut(old).blocks.remove(0);
            let mut cursor = program.block(b).first_insn().and_then(|i| program.next_insn(i));
            while let Some(i) = cursor {
                if program.insn(i).block != Some(b) {
                    program.function_mut(old).first_insn = i;
                    break;
                }
                cursor = program.next_insn(i);
            }
        } else {
            program.function_mut(old).blocks.retain(|&x| x != b);
        }
        program.function_mut(fct).blocks.push(b);
        program.block_mut(b).function = fct;

        // Successor edges that now leave the function become call edges,
        // except towards the patch-section function itself.
        let node = program.block(b).cfg_node;
        let out: Vec<_> = program.cfg.out_edges(node).to_vec();
        let mut removed = Vec::new();
        for e in out {
            let dst = program.cfg.node(program.cfg.edge(e).to).data;
            let dst_fct = program.block(dst).function;
            if dst_fct != fct
                && program.label(program.function(dst_fct).label).kind != LabelKind::PatchSection
            {
                removed.push(e);
                let from = program.function(fct).cg_node;
                let to = program.function(dst_fct).cg_node;
                program.cg.add_edge(from, to, ());
            }
        }
        for e in removed {
            program.cfg.remove_edge(e);
        }

        for i in program.block(b).insns.clone() {
            program.insn_mut(i).label = new_label;
        }
    }
}
