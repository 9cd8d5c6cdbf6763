//! SSA Construction
//!
//! Builds the SSA view of a function: dominance frontiers, pruned
//! phi-function insertion (Cytron et al.), variable renaming over the
//! dominance tree, and a few phi simplifications that remove artifacts of
//! the standard algorithm on machine code.
//!
//! # Representation
//! The SSA form of a function is one [`SsaBlock`] per basic block, holding
//! an ordered list of [`SsaInsn`]: phi-functions first, then one SSA
//! decoration per original instruction.
//!
//! A regular SSA instruction keeps its operands in a flat array with two
//! slots per original operand: for a register operand slot `2*i` is the
//! register and slot `2*i + 1` is `None`; for a memory operand slot `2*i`
//! is the base and `2*i + 1` the index. Implicit source registers are
//! appended at the end. Outputs grow one entry per written register
//! (explicit and implicit), except for instructions that only set flags
//! (`CMP`, same-register `XCHG`).
//!
//! A phi instruction has one operand slot per CFG predecessor (plus one
//! version-0 slot on the function entry block) and exactly one output.
//!
//! An operand's `def` link points at the SSA instruction producing it; a
//! *defining* variable's `def` link points at the previous definition of
//! the same register. Version 0 is the value at function entry.

use std::collections::HashMap;

use crate::analysis::dominance::dominates;
use crate::program::arch::Reg;
use crate::program::block::BlockId;
use crate::program::function::FunctionId;
use crate::program::insn::{Family, InsnId, OperandKind};
use crate::program::{AnalyzeFlags, Program};

/// Handle on an SSA instruction inside its [`SsaForm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SsaInsnId(pub u32);

/// SSA variable: a standardized register and a version index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsaVar {
    pub reg: Reg,
    /// Version; 0 is the value at function entry, -1 is not yet renamed.
    pub index: i64,
    /// Defining SSA instruction (for a defining variable: the *previous*
    /// definition of the register).
    pub def: Option<SsaInsnId>,
}

impl SsaVar {
    fn new(reg: Reg, index: i64) -> Self {
        SsaVar {
            reg,
            index,
            def: None,
        }
    }

    /// Version equality, the identity used by phi simplifications.
    pub fn same_version(a: Option<&SsaVar>, b: Option<&SsaVar>) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(x), Some(y)) => x.index == y.index && x.reg == y.reg,
            _ => false,
        }
    }
}

/// SSA instruction: a phi-function (`insn` is `None`) or the decoration of
/// an original instruction.
#[derive(Debug, Clone)]
pub struct SsaInsn {
    pub insn: Option<InsnId>,
    pub block: BlockId,
    /// Flat operand array, see module documentation.
    pub operands: Vec<Option<SsaVar>>,
    /// Number of implicit source slots appended to `operands`.
    pub nb_implicit: usize,
    pub outputs: Vec<SsaVar>,
}

impl SsaInsn {
    pub fn is_phi(&self) -> bool {
        self.insn.is_none()
    }

    /// Operand count of a phi (trailing `None` slots excluded).
    pub fn phi_operand_count(&self) -> usize {
        self.operands.iter().take_while(|o| o.is_some()).count()
    }
}

/// SSA view of one basic block.
#[derive(Debug, Clone)]
pub struct SsaBlock {
    pub block: BlockId,
    /// Phi-functions first, then instruction decorations in order.
    pub insns: Vec<SsaInsnId>,
}

/// SSA form of a function.
#[derive(Debug, Clone)]
pub struct SsaForm {
    /// Indexed by per-function block id.
    pub blocks: Vec<SsaBlock>,
    pub insns: Vec<SsaInsn>,
    /// Per register id: the SSA instruction defining each version
    /// (version 0 has no definition).
    pub defs: Vec<Vec<Option<SsaInsnId>>>,
    pub nb_regs: usize,
}

impl SsaForm {
    pub fn insn(&self, id: SsaInsnId) -> &SsaInsn {
        &self.insns[id.0 as usize]
    }

    fn insn_mut(&mut self, id: SsaInsnId) -> &mut SsaInsn {
        &mut self.insns[id.0 as usize]
    }

    /// Phi-functions at the head of a block.
    pub fn phis(&self, block_id: u32) -> impl Iterator<Item = SsaInsnId> + '_ {
        self.blocks[block_id as usize]
            .insns
            .iter()
            .copied()
            .take_while(|&i| self.insn(i).is_phi())
    }
}

/// Renaming state shared across the dominator-tree walk.
struct RenameState {
    /// Next version per register id.
    counters: Vec<i64>,
    /// Version stack per register id.
    stacks: Vec<Vec<i64>>,
    /// Defining SSA instruction per register id and version.
    defs: Vec<Vec<Option<SsaInsnId>>>,
}

/// SSA builder.
pub struct SsaAnalyzer;

impl SsaAnalyzer {
    /// Computes (and caches) the SSA form of a function. Prerequisite
    /// stages (dominance, loops, live registers) are demand-computed.
    pub fn compute(program: &mut Program, function: FunctionId) {
        if program.function(function).ssa.is_some() {
            return;
        }
        if !program.analyze_flags.contains(AnalyzeFlags::CFG) {
            return;
        }
        crate::analysis::dominance::DominanceAnalyzer::analyze(program);
        crate::analysis::loop_analysis::LoopAnalyzer::analyze(program);
        crate::analysis::live_registers::LiveRegisterAnalyzer::compute(program, function);
        program.renumber_blocks(function);

        log::debug!(
            "computing SSA for function {}",
            program.function_name(function)
        );
        let nb_regs = program.arch.nb_registers();
        let nb_blocks = program.function(function).blocks.len();

        let mut form = SsaForm {
            blocks: Vec::with_capacity(nb_blocks),
            insns: Vec::new(),
            defs: Vec::new(),
            nb_regs,
        };
        for &b in &program.function(function).blocks {
            form.blocks.push(SsaBlock {
                block: b,
                insns: Vec::new(),
            });
        }

        log::debug!("--- computing dominance frontier");
        let df = Self::dominance_frontier(program, function);
        log::debug!("--- inserting phi functions");
        Self::insert_phi_functions(program, function, &df, &mut form);
        log::debug!("--- renaming variables");
        let state = Self::rename_variables(program, function, &mut form);
        Self::link_loop_phis(program, function, &mut form, &state);
        log::debug!("--- simplifying phi operands");
        Self::simplify_phi_operands(&mut form);
        log::debug!("--- removing invariant loop phis");
        Self::delete_invariant_loop_phis(program, function, &mut form);
        log::debug!("--- removing same-load phis");
        Self::delete_same_load_phis(program, function, &mut form);

        form.defs = state.defs;
        program.function_mut(function).ssa = Some(form);
    }

    // -------------------------------------------------------------------
    // Dominance frontier

    /// Bottom-up dominance frontier over the dominance tree:
    /// `DF(X) = DF_local(X) ∪ DF_up(X)`.
    fn dominance_frontier(program: &Program, function: FunctionId) -> Vec<Vec<BlockId>> {
        let nb_blocks = program.function(function).blocks.len();
        let mut df: Vec<Vec<BlockId>> = vec![Vec::new(); nb_blocks];
        let entry = match program.function(function).entry_block() {
            Some(b) => b,
            None => return df,
        };

        // Post-order over the dominance tree.
        let mut order: Vec<BlockId> = Vec::new();
        let mut stack: Vec<(BlockId, bool)> = vec![(entry, false)];
        while let Some((b, expanded)) = stack.pop() {
            if expanded {
                order.push(b);
            } else {
                stack.push((b, true));
                for &c in &program.block(b).dom_children {
                    stack.push((c, false));
                }
            }
        }

        for &x in &order {
            let x_slot = program.block(x).id as usize;

            // DF_local: successors not immediately dominated by X.
            let succs: Vec<BlockId> = program
                .cfg
                .successors(program.block(x).cfg_node)
                .map(|n| program.cfg.node(n).data)
                .collect();
            for y in succs {
                if program.block(y).idom != Some(x) {
                    df[x_slot].push(y);
                }
            }

            // DF_up: frontier of the children, filtered the same way.
            for &z in &program.block(x).dom_children {
                let z_slot = program.block(z).id as usize;
                let inherited: Vec<BlockId> = df[z_slot]
                    .iter()
                    .copied()
                    .filter(|&y| program.block(y).idom != Some(x))
                    .collect();
                df[x_slot].extend(inherited);
            }
        }
        df
    }

    // -------------------------------------------------------------------
    // Phi insertion

    /// Variables assigned in the function and the blocks assigning them.
    fn compute_assignments(
        program: &Program,
        function: FunctionId,
    ) -> HashMap<Reg, Vec<BlockId>> {
        let mut a: HashMap<Reg, Vec<BlockId>> = HashMap::new();
        let mut record = |reg: Reg, b: BlockId, a: &mut HashMap<Reg, Vec<BlockId>>| {
            let s = program.arch.standardize(reg);
            let blocks = a.entry(s).or_default();
            if blocks.last() != Some(&b) {
                blocks.push(b);
            }
        };
        for &b in &program.function(function).blocks {
            for &insn in &program.block(b).insns {
                let i = program.insn(insn);
                for op in &i.operands {
                    if op.is_dst() {
                        if let Some(r) = op.reg() {
                            record(r, b, &mut a);
                        }
                    }
                }
                for &r in program.arch.implicit_destinations(i.family) {
                    record(r, b, &mut a);
                }
            }
        }
        a
    }

    /// Pruned phi insertion: a phi for V lands in the iterated dominance
    /// frontier of V's assignment blocks, but only where V is live in.
    fn insert_phi_functions(
        program: &Program,
        function: FunctionId,
        df: &[Vec<BlockId>],
        form: &mut SsaForm,
    ) {
        let assignments = Self::compute_assignments(program, function);
        let nb_blocks = program.function(function).blocks.len();
        let mut has_already: Vec<i64> = vec![0; nb_blocks];
        let mut work: Vec<i64> = vec![0; nb_blocks];
        let mut iter_count = 0i64;

        let live = match program.function(function).live_registers.as_ref() {
            Some(live) => live,
            None => return,
        };
        let entry = program.function(function).entry_block();

        for (&v, blocks) in &assignments {
            iter_count += 1;
            let mut worklist: Vec<BlockId> = Vec::new();
            for &x in blocks {
                work[program.block(x).id as usize] = iter_count;
                worklist.push(x);
            }
            let mut head = 0usize;
            while head < worklist.len() {
                let x = worklist[head];
                head += 1;
                for &y in &df[program.block(x).id as usize] {
                    let y_slot = program.block(y).id as usize;
                    if has_already[y_slot] < iter_count {
                        if live.is_in(y_slot as u32, program.arch.reg_id(v)) {
                            Self::new_phi(program, v, y, entry, form);
                        }
                        has_already[y_slot] = iter_count;
                        if work[y_slot] < iter_count {
                            work[y_slot] = iter_count;
                            worklist.push(y);
                        }
                    }
                }
            }
        }
    }

    /// Creates a phi for `reg` at the head of `b`: one operand slot per
    /// predecessor, plus the version-0 slot on the function entry block.
    fn new_phi(
        program: &Program,
        reg: Reg,
        b: BlockId,
        entry: Option<BlockId>,
        form: &mut SsaForm,
    ) {
        let mut nb = program.cfg.in_edges(program.block(b).cfg_node).len();
        if Some(b) == entry {
            nb += 1;
        }
        let id = SsaInsnId(form.insns.len() as u32);
        form.insns.push(SsaInsn {
            insn: None,
            block: b,
            operands: vec![Some(SsaVar::new(program.arch.standardize(reg), -1)); nb],
            nb_implicit: 0,
            outputs: vec![SsaVar::new(program.arch.standardize(reg), -1)],
        });
        form.blocks[program.block(b).id as usize].insns.push(id);
    }

    // -------------------------------------------------------------------
    // Renaming

    /// Instructions whose register destination is not an SSA output:
    /// compares only set flags, and the degenerate same-register exchange.
    fn filter_output(program: &Program, insn: InsnId) -> bool {
        let i = program.insn(insn);
        if i.family == Family::Cmp {
            return true;
        }
        if i.family == Family::Xchg && i.operands.len() == 2 {
            if let (Some(a), Some(b)) = (i.operands[0].reg(), i.operands[1].reg()) {
                return a == b;
            }
        }
        false
    }

    /// Renaming over the dominance tree with an explicit work stack.
    fn rename_variables(
        program: &Program,
        function: FunctionId,
        form: &mut SsaForm,
    ) -> RenameState {
        let nb_regs = program.arch.nb_registers();
        let mut state = RenameState {
            counters: vec![1; nb_regs],
            stacks: vec![vec![0]; nb_regs],
            defs: vec![vec![None]; nb_regs],
        };

        let entry = match program.function(function).entry_block() {
            Some(b) => b,
            None => return state,
        };

        // The extra slot of the entry block phis carries version 0, the
        // value at function entry.
        let entry_preds = program.cfg.in_edges(program.block(entry).cfg_node).len();
        let entry_phis: Vec<SsaInsnId> = form.phis(program.block(entry).id).collect();
        for phi in entry_phis {
            if let Some(slot) = form.insn_mut(phi).operands.get_mut(entry_preds) {
                if let Some(var) = slot {
                    var.index = 0;
                }
            }
        }

        enum Frame {
            Enter(BlockId),
            Exit(BlockId),
        }
        let mut walk: Vec<Frame> = vec![Frame::Enter(entry)];
        while let Some(frame) = walk.pop() {
            match frame {
                Frame::Enter(x) => {
                    walk.push(Frame::Exit(x));
                    Self::rename_block(program, x, form, &mut state);
                    // Children pushed in reverse so they run in tree order.
                    for &c in program.block(x).dom_children.iter().rev() {
                        walk.push(Frame::Enter(c));
                    }
                }
                Frame::Exit(x) => {
                    let insns = form.blocks[program.block(x).id as usize].insns.clone();
                    for ssa_id in insns {
                        let outputs: Vec<Reg> =
                            form.insn(ssa_id).outputs.iter().map(|o| o.reg).collect();
                        for reg in outputs {
                            state.stacks[program.arch.reg_id(reg)].pop();
                        }
                    }
                }
            }
        }
        state
    }

    /// Renames one block: phi outputs, instruction operands and outputs,
    /// then the phi slots of the CFG successors.
    fn rename_block(
        program: &Program,
        x: BlockId,
        form: &mut SsaForm,
        state: &mut RenameState,
    ) {
        let x_slot = program.block(x).id as usize;

        // Phi left-hand sides first: they define before any instruction.
        let phis: Vec<SsaInsnId> = form.phis(x_slot as u32).collect();
        for phi in phis {
            let v = form.insn(phi).outputs[0].reg;
            let rid = program.arch.reg_id(v);
            let i = state.counters[rid];
            form.insn_mut(phi).outputs[0].index = i;
            state.stacks[rid].push(i);
            state.counters[rid] = i + 1;
            state.defs[rid].resize(i as usize + 2, None);
            state.defs[rid][i as usize] = Some(phi);
        }

        // Instruction decorations.
        for &insn in &program.block(x).insns {
            let ssa_id = Self::new_ssa_insn(program, insn, x, form);

            // Right-hand side: every register operand slot picks up the
            // version on top of its stack.
            let i = program.insn(insn);
            for (idx, op) in i.operands.iter().enumerate() {
                match op.kind {
                    OperandKind::Mem(m) => {
                        if let Some(base) = m.base {
                            Self::use_var(program, form, state, ssa_id, base, idx * 2);
                        }
                        if let Some(index) = m.index {
                            Self::use_var(program, form, state, ssa_id, index, idx * 2 + 1);
                        }
                    }
                    OperandKind::Reg(r) => {
                        Self::use_var(program, form, state, ssa_id, r, idx * 2);
                    }
                    _ => {}
                }
            }
            let implicit_src: Vec<Reg> = program.arch.implicit_sources(i.family).to_vec();
            if !implicit_src.is_empty() {
                let base = i.operands.len() * 2;
                form.insn_mut(ssa_id).nb_implicit = implicit_src.len();
                for (k, &r) in implicit_src.iter().enumerate() {
                    form.insn_mut(ssa_id)
                        .operands
                        .push(Some(SsaVar::new(program.arch.standardize(r), -1)));
                    Self::use_var(program, form, state, ssa_id, r, base + k);
                }
            }

            // Left-hand side: fresh versions.
            for op in i.operands.iter() {
                if op.is_dst() {
                    if let Some(r) = op.reg() {
                        Self::define_var(program, form, state, ssa_id, insn, r);
                    }
                }
            }
            for &r in program.arch.implicit_destinations(i.family) {
                Self::define_var(program, form, state, ssa_id, insn, r);
            }
        }

        // Fill our slot in the phis of every CFG successor.
        let node = program.block(x).cfg_node;
        let succs: Vec<BlockId> = program
            .cfg
            .successors(node)
            .map(|n| program.cfg.node(n).data)
            .collect();
        for y in succs {
            if program.block(y).function != program.block(x).function {
                continue;
            }
            let j = match Self::which_pred(program, y, x) {
                Some(j) => j,
                None => continue,
            };
            let y_phis: Vec<SsaInsnId> = form.phis(program.block(y).id).collect();
            for phi in y_phis {
                let v = form.insn(phi).outputs[0].reg;
                let rid = program.arch.reg_id(v);
                let top = *state.stacks[rid].last().unwrap_or(&0);
                if let Some(Some(var)) = form.insn_mut(phi).operands.get_mut(j) {
                    var.index = top;
                    var.def = state.defs[rid].get(top as usize).copied().flatten();
                }
            }
        }
    }

    /// Position of `p` in the predecessor list of `s`.
    fn which_pred(program: &Program, s: BlockId, p: BlockId) -> Option<usize> {
        program
            .cfg
            .in_edges(program.block(s).cfg_node)
            .iter()
            .position(|&e| program.cfg.node(program.cfg.edge(e).from).data == p)
    }

    /// Creates the SSA decoration of an instruction: two operand slots per
    /// original operand.
    fn new_ssa_insn(
        program: &Program,
        insn: InsnId,
        block: BlockId,
        form: &mut SsaForm,
    ) -> SsaInsnId {
        let i = program.insn(insn);
        let mut operands: Vec<Option<SsaVar>> = Vec::with_capacity(i.operands.len() * 2);
        for op in &i.operands {
            match op.kind {
                OperandKind::Mem(m) => {
                    operands.push(m.base.map(|r| SsaVar::new(program.arch.standardize(r), -1)));
                    operands.push(m.index.map(|r| SsaVar::new(program.arch.standardize(r), -1)));
                }
                OperandKind::Reg(r) => {
                    operands.push(Some(SsaVar::new(program.arch.standardize(r), -1)));
                    operands.push(None);
                }
                _ => {
                    operands.push(None);
                    operands.push(None);
                }
            }
        }
        let id = SsaInsnId(form.insns.len() as u32);
        form.insns.push(SsaInsn {
            insn: Some(insn),
            block,
            operands,
            nb_implicit: 0,
            outputs: Vec::new(),
        });
        form.blocks[program.block(block).id as usize].insns.push(id);
        id
    }

    /// Resolves an operand slot to the current version of the register.
    fn use_var(
        program: &Program,
        form: &mut SsaForm,
        state: &RenameState,
        ssa_id: SsaInsnId,
        reg: Reg,
        slot: usize,
    ) {
        let rid = program.arch.reg_id(reg);
        let top = *state.stacks[rid].last().unwrap_or(&0);
        if let Some(Some(var)) = form.insn_mut(ssa_id).operands.get_mut(slot) {
            var.index = top;
            var.def = state.defs[rid].get(top as usize).copied().flatten();
        }
    }

    /// Assigns a fresh version to a written register.
    fn define_var(
        program: &Program,
        form: &mut SsaForm,
        state: &mut RenameState,
        ssa_id: SsaInsnId,
        insn: InsnId,
        reg: Reg,
    ) {
        if Self::filter_output(program, insn) {
            return;
        }
        let v = program.arch.standardize(reg);
        let rid = program.arch.reg_id(v);
        let i = state.counters[rid];
        let mut var = SsaVar::new(v, i);
        // A defining variable links to the previous definition.
        var.def = state.defs[rid].get(i as usize - 1).copied().flatten();
        form.insn_mut(ssa_id).outputs.push(var);

        state.stacks[rid].push(i);
        state.counters[rid] = i + 1;
        state.defs[rid].resize(i as usize + 2, None);
        state.defs[rid][i as usize] = Some(ssa_id);
    }

    // -------------------------------------------------------------------
    // Post-renaming phi adjustments

    /// Links the output of loop-header phis to the definition reaching the
    /// loop from outside (the non-back-edge predecessor). Only loop entry
    /// blocks with exactly two predecessors are handled.
    fn link_loop_phis(
        program: &Program,
        function: FunctionId,
        form: &mut SsaForm,
        state: &RenameState,
    ) {
        for &b in &program.function(function).blocks {
            let is_loop_entry = match program.block(b).loop_ {
                Some(l) => program.loop_(l).entries.contains(&b),
                None => false,
            };
            let preds: Vec<BlockId> = program
                .cfg
                .predecessors(program.block(b).cfg_node)
                .map(|n| program.cfg.node(n).data)
                .collect();
            if !is_loop_entry || preds.len() != 2 {
                continue;
            }
            // The outside predecessor is the one not sharing the loop.
            let pred = if program.block(preds[0]).loop_ == program.block(b).loop_ {
                1
            } else {
                0
            };
            let phis: Vec<SsaInsnId> = form.phis(program.block(b).id).collect();
            for phi in phis {
                let rid = program.arch.reg_id(form.insn(phi).outputs[0].reg);
                let index = match form.insn(phi).operands.get(pred).copied().flatten() {
                    Some(var) => var.index,
                    None => continue,
                };
                form.insn_mut(phi).outputs[0].def =
                    state.defs[rid].get(index as usize).copied().flatten();
            }
        }
    }

    // -------------------------------------------------------------------
    // Phi simplifications

    /// Collapses each phi's operand list to the distinct versions.
    fn simplify_phi_operands(form: &mut SsaForm) {
        for i in 0..form.insns.len() {
            if !form.insns[i].is_phi() {
                continue;
            }
            let mut kept: Vec<SsaVar> = Vec::new();
            for op in form.insns[i].operands.iter().flatten() {
                if !kept.iter().any(|k| k.index == op.index) {
                    kept.push(*op);
                }
            }
            form.insns[i].operands = kept.into_iter().map(Some).collect();
        }
    }

    /// Position of the phi operand defined outside the loop: its defining
    /// block dominates the phi's block.
    fn outside_operand(program: &Program, form: &SsaForm, phi: SsaInsnId) -> Option<usize> {
        let p = form.insn(phi);
        for (i, op) in p.operands.iter().enumerate() {
            let op = match op {
                Some(op) => op,
                None => break,
            };
            let def = op.def?;
            let def_block = form.insn(def).block;
            if dominates(program, def_block, p.block) {
                return Some(i);
            }
        }
        None
    }

    /// Does any instruction of the loop write `reg` with a value other than
    /// the constant `cst`?
    fn loop_overwrites_reg(
        program: &Program,
        loop_blocks: &[BlockId],
        reg: Reg,
        cst: i64,
    ) -> bool {
        for &b in loop_blocks {
            for &insn in &program.block(b).insns {
                let i = program.insn(insn);
                if i.operands.len() == 2 {
                    let op = &i.operands[1];
                    if op.is_dst()
                        && op.reg().map(|r| program.arch.standardize(r)) == Some(reg)
                    {
                        match i.operands[0].imm() {
                            Some(v) if v == cst => {}
                            _ => return true,
                        }
                    }
                } else {
                    for op in &i.operands {
                        if op.is_dst()
                            && op.reg().map(|r| program.arch.standardize(r)) == Some(reg)
                        {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    /// Removes the phis of loops whose register always holds the same
    /// immediate: a phi over a constant is an affectation.
    fn delete_invariant_loop_phis(program: &Program, function: FunctionId, form: &mut SsaForm) {
        for &l in &program.function(function).loops {
            let lp = program.loop_(l);
            if lp.body_entries().count() != 1 {
                continue;
            }
            let header = lp.header();
            let phis: Vec<SsaInsnId> = form.phis(program.block(header).id).collect();
            for phi in phis {
                let pred_id = match Self::outside_operand(program, form, phi) {
                    Some(i) => i,
                    None => continue,
                };

                // The outside definition must load an immediate.
                let def = match form.insn(phi).operands[pred_id].and_then(|o| o.def) {
                    Some(d) => d,
                    None => continue,
                };
                let def_insn = match form.insn(def).insn {
                    Some(i) => program.insn(i),
                    None => continue,
                };
                if def_insn.operands.len() != 2 || def_insn.family != Family::Mov {
                    continue;
                }
                let cst = match def_insn.operands[0].imm() {
                    Some(c) => c,
                    None => continue,
                };

                let reg = form.insn(phi).outputs[0].reg;
                if !Self::loop_overwrites_reg(program, &lp.blocks, reg, cst) {
                    let index = form.insn(phi).operands[pred_id].map(|o| o.index).unwrap_or(0);
                    let prev = form.insn(phi).operands[pred_id].and_then(|o| o.def);
                    // Rewrite every phi of this register in the loop.
                    for &bb in &lp.blocks {
                        let bb_phis: Vec<SsaInsnId> =
                            form.phis(program.block(bb).id).collect();
                        for p in bb_phis {
                            if form.insn(p).outputs[0].reg == reg {
                                let target = form.insn_mut(p);
                                target.operands.truncate(1);
                                if let Some(Some(op)) = target.operands.get_mut(0) {
                                    op.index = index;
                                    op.def = prev;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Removes two-operand phis whose both operands are defined by the same
    /// memory load: same family (`MOV` or `LEA`), same expression, same
    /// offset.
    fn delete_same_load_phis(program: &Program, function: FunctionId, form: &mut SsaForm) {
        for &l in &program.function(function).loops {
            let lp = program.loop_(l);
            if lp.body_entries().count() != 1 {
                continue;
            }
            let header = lp.header();
            let phis: Vec<SsaInsnId> = form.phis(program.block(header).id).collect();
            for phi in phis {
                let p = form.insn(phi);
                if p.phi_operand_count() != 2 {
                    continue;
                }
                let (d0, d1) = match (
                    p.operands[0].and_then(|o| o.def),
                    p.operands[1].and_then(|o| o.def),
                ) {
                    (Some(a), Some(b)) => (a, b),
                    _ => continue,
                };
                let (i0, i1) = match (form.insn(d0).insn, form.insn(d1).insn) {
                    (Some(a), Some(b)) => (a, b),
                    _ => continue,
                };
                let (f0, f1) = (program.insn(i0).family, program.insn(i1).family);
                let same_family = (f0 == Family::Mov && f1 == Family::Mov)
                    || (f0 == Family::Lea && f1 == Family::Lea);
                if !same_family
                    || program.insn(i0).operands.len() != 2
                    || program.insn(i1).operands.len() != 2
                {
                    continue;
                }
                let same_expr = SsaVar::same_version(
                    form.insn(d0).operands[0].as_ref(),
                    form.insn(d1).operands[0].as_ref(),
                ) && SsaVar::same_version(
                    form.insn(d0).operands[1].as_ref(),
                    form.insn(d1).operands[1].as_ref(),
                );
                let off0 = program.insn(i0).operands[0].mem().map(|m| m.offset);
                let off1 = program.insn(i1).operands[0].mem().map(|m| m.offset);
                if same_expr && off0.is_some() && off0 == off1 {
                    // Keep the operand defined before the loop.
                    if let Some(pred_id) = Self::outside_operand(program, form, phi) {
                        let keep = form.insn(phi).operands[pred_id];
                        let target = form.insn_mut(phi);
                        target.operands[0] = keep;
                        target.operands.truncate(1);
                    }
                }
            }
        }
    }
}
