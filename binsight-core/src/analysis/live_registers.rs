//! Live Registers Analysis
//!
//! Iterative backwards dataflow computing the registers live at the entry
//! and exit of every basic block, following the algorithm in "Compilers:
//! Principles, Techniques & Tools" (Aho, Lam, Sethi, Ullman).
//!
//! Registers are standardized before being tracked: registers with the same
//! name but different types of one family (an XMM register and the low half
//! of the same-name YMM register) fold into a single logical register, so
//! the dense register id space is `nb_families * nb_names + 1` with the
//! program counter at id 0.
//!
//! # USE/DEF rules
//! - a `CALL` USEs every argument register (unless already DEF'd) and DEFs
//!   every return register (unless already USE'd), following the calling
//!   convention for external calls;
//! - every source register, and every register appearing in a memory
//!   address, is USE'd if not already DEF'd;
//! - every destination register and every implicit destination is DEF'd if
//!   not already USE'd;
//! - the function entry block USEs every argument register up-front.
//!
//! Blocks containing an instruction annotated `EX` seed their OUT set with
//! the return registers. The IN/OUT sets then iterate to a fixed point:
//! `OUT(B) = ⋃ IN(S)`, `IN(B) = USE(B) ∪ (OUT(B) \ DEF(B))`.

use bitvec::prelude::*;

use crate::program::block::BlockId;
use crate::program::function::FunctionId;
use crate::program::insn::{Annotations, OperandKind};
use crate::program::Program;

/// Per-function live-register sets, indexed by per-function block id then
/// standardized register id.
#[derive(Debug, Clone)]
pub struct LiveRegisters {
    pub nb_regs: usize,
    in_: Vec<BitVec>,
    out: Vec<BitVec>,
}

impl LiveRegisters {
    /// Register `reg_id` is live at the entry of block `block_id`.
    pub fn is_in(&self, block_id: u32, reg_id: usize) -> bool {
        self.in_[block_id as usize][reg_id]
    }

    /// Register `reg_id` is live at the exit of block `block_id`.
    pub fn is_out(&self, block_id: u32, reg_id: usize) -> bool {
        self.out[block_id as usize][reg_id]
    }
}

/// Per-function USE/DEF sets, indexed like [`LiveRegisters`].
#[derive(Debug, Clone)]
pub struct UseDefSets {
    pub nb_regs: usize,
    pub use_: Vec<BitVec>,
    pub def: Vec<BitVec>,
}

impl UseDefSets {
    pub fn new(nb_blocks: usize, nb_regs: usize) -> Self {
        UseDefSets {
            nb_regs,
            use_: vec![bitvec![0; nb_regs]; nb_blocks],
            def: vec![bitvec![0; nb_regs]; nb_blocks],
        }
    }

    fn add_use(&mut self, block: usize, reg: usize) {
        if !self.def[block][reg] {
            self.use_[block].set(reg, true);
        }
    }

    fn add_def(&mut self, block: usize, reg: usize) {
        if !self.use_[block][reg] {
            self.def[block].set(reg, true);
        }
    }
}

/// Live-register analyzer.
pub struct LiveRegisterAnalyzer;

impl LiveRegisterAnalyzer {
    /// Computes (and caches) the live registers of a function.
    pub fn compute(program: &mut Program, function: FunctionId) {
        if program.function(function).live_registers.is_some() {
            return;
        }
        program.renumber_blocks(function);
        let nb_regs = program.arch.nb_registers();
        let nb_blocks = program.function(function).blocks.len();

        let mut use_def = UseDefSets::new(nb_blocks, nb_regs);

        // The entry block uses every argument register.
        if let Some(entry) = program.function(function).entry_block() {
            let entry_id = program.block(entry).id as usize;
            for &v in program.arch.arg_regs.clone().iter() {
                use_def.add_use(entry_id, program.arch.reg_id(v));
            }
        }
        for &b in &program.function(function).blocks.clone() {
            Self::compute_use_def_in_block(program, b, &mut use_def);
        }

        let live = Self::compute_in_out(program, function, &use_def);
        program.function_mut(function).live_registers = Some(live);
    }

    /// USE/DEF sets of one block. Public: the SSA construction reuses it.
    pub fn compute_use_def_in_block(program: &Program, b: BlockId, use_def: &mut UseDefSets) {
        let arch = &program.arch;
        let slot = program.block(b).id as usize;

        for &insn in &program.block(b).insns {
            let i = program.insn(insn);

            // Calls: argument registers read, return registers written.
            if i.has(Annotations::CALL) {
                for &v in &arch.arg_regs {
                    use_def.add_use(slot, arch.reg_id(v));
                }
                for &v in &arch.return_regs {
                    use_def.add_def(slot, arch.reg_id(v));
                }
            }

            // Registers used before being defined.
            for op in &i.operands {
                match op.kind {
                    OperandKind::Reg(r) if op.is_src() => {
                        use_def.add_use(slot, arch.reg_id(r));
                    }
                    OperandKind::Mem(m) => {
                        if let Some(base) = m.base {
                            use_def.add_use(slot, arch.reg_id(base));
                        }
                        if let Some(index) = m.index {
                            use_def.add_use(slot, arch.reg_id(index));
                        }
                    }
                    _ => {}
                }
            }
            for &v in arch.implicit_sources(i.family) {
                use_def.add_use(slot, arch.reg_id(v));
            }

            // Registers defined before being used.
            for op in &i.operands {
                if op.is_dst() {
                    if let Some(r) = op.reg() {
                        use_def.add_def(slot, arch.reg_id(r));
                    }
                }
            }
            for &v in arch.implicit_destinations(i.family) {
                use_def.add_def(slot, arch.reg_id(v));
            }
        }
    }

    /// IN/OUT fixed point.
    fn compute_in_out(
        program: &Program,
        function: FunctionId,
        use_def: &UseDefSets,
    ) -> LiveRegisters {
        let nb_regs = use_def.nb_regs;
        let blocks = &program.function(function).blocks;
        let mut live = LiveRegisters {
            nb_regs,
            in_: vec![bitvec![0; nb_regs]; blocks.len()],
            out: vec![bitvec![0; nb_regs]; blocks.len()],
        };

        // Exit blocks keep the return registers alive.
        for &b in blocks {
            let has_exit = program.block(b).insns.iter().any(|&i| {
                program
                    .insn(i)
                    .has(Annotations::EX)
            });
            if has_exit {
                let slot = program.block(b).id as usize;
                for &v in &program.arch.return_regs {
                    live.out[slot].set(program.arch.reg_id(v), true);
                }
            }
        }

        let mut changes = true;
        while changes {
            changes = false;
            for &b in blocks {
                let slot = program.block(b).id as usize;

                // OUT(B) = ⋃ IN(S), S a successor of B.
                let succ_ids: Vec<usize> = program
                    .cfg
                    .successors(program.block(b).cfg_node)
                    .map(|n| program.cfg.node(n).data)
                    .filter(|&s| program.block(s).function == function)
                    .map(|s| program.block(s).id as usize)
                    .collect();
                for s in succ_ids {
                    let succ_in = live.in_[s].clone();
                    live.out[slot] |= succ_in;
                }

                // IN(B) = USE(B) ∪ (OUT(B) \ DEF(B)).
                for r in 0..nb_regs {
                    if use_def.use_[slot][r] || (!use_def.def[slot][r] && live.out[slot][r]) {
                        if !live.in_[slot][r] {
                            changes = true;
                            live.in_[slot].set(r, true);
                        }
                    }
                }
            }
        }
        live
    }
}
