//! Indirect Branch Solver
//!
//! Resolves table-based indirect jumps by recognizing the compiler idiom
//!
//! ```text
//!     MOV offset(, index, scale), tgt
//!     ... (tgt and index unchanged) ...
//!     CMP imm, index
//!     JCC somewhere
//!     JMP tgt
//! ```
//!
//! When the idiom matches and the jump table (`(imm + 1) * scale` bytes at
//! `offset`) is readable from the file image, every slot is decoded as a
//! little-endian address and a CFG edge is added towards the block starting
//! there, splitting a block when the address lands in its middle.
//!
//! The solver is intentionally narrow: it never invents edges the idiom does
//! not prove. Every indirect jump is annotated `IBNOTSOLVE` up-front; a full
//! resolution replaces it with `IBSOLVE`. Downstream analyses treat an
//! unsolved indirect jump as having no successors.

use crate::program::block::BlockId;
use crate::program::function::FunctionId;
use crate::program::insn::{Annotations, Family, InsnId, MemRef, OperandKind};
use crate::program::Program;

use crate::program::arch::Reg;

/// Solves indirect branches of one function using the CMP idiom.
pub fn solve_function(program: &mut Program, function: FunctionId) {
    let blocks = program.function(function).blocks.clone();
    for b in blocks {
        if is_indirect_block(program, b) {
            let last = match program.block(b).last_insn() {
                Some(i) => i,
                None => continue,
            };
            program.insn_mut(last).annotations |= Annotations::IBNOTSOLVE;
            log::debug!(
                "trying to solve indirect branch in block {}, at address 0x{:X}",
                program.block(b).id,
                program.insn(last).address
            );
            solve_block(program, b);
        }
    }
}

/// The block ends with an indirect jump (a jump without pointer operand).
fn is_indirect_block(program: &Program, b: BlockId) -> bool {
    match program.block(b).last_insn() {
        Some(last) => {
            let insn = program.insn(last);
            insn.family == Family::Jump && !insn.operands.iter().any(|o| o.is_ptr())
        }
        None => false,
    }
}

/// Does `insn` modify `reg`? The jump instruction itself (at `jump_addr`)
/// and reads are ignored; any other instruction whose last operand is a
/// same-name register counts as a modification.
fn modifies_reg(program: &Program, insn: InsnId, reg: Reg, jump_addr: u64) -> bool {
    let i = program.insn(insn);
    if i.address == jump_addr || i.family == Family::Jump {
        return false;
    }
    match i.operands.last().and_then(|o| o.reg()) {
        Some(r) => r.name == reg.name,
        None => false,
    }
}

/// Finds the last `MOV` defining a same-name register in `b`, walking the
/// block backwards. Sets `clobbered` when another write to the register is
/// crossed first.
fn find_last_definition(
    program: &Program,
    target: Reg,
    b: BlockId,
    clobbered: &mut bool,
    jump_addr: u64,
) -> Option<InsnId> {
    for &insn in program.block(b).insns.iter().rev() {
        let i = program.insn(insn);
        if i.family == Family::Mov {
            if let Some(r) = i.operands.get(1).and_then(|o| o.reg()) {
                if r.name == target.name {
                    return Some(insn);
                }
            }
        }
        if modifies_reg(program, insn, target, jump_addr) {
            *clobbered = true;
            return None;
        }
    }
    None
}

/// Single CFG predecessor of a block, if unique.
fn single_predecessor(program: &Program, b: BlockId) -> Option<BlockId> {
    let node = program.block(b).cfg_node;
    let preds = program.cfg.in_edges(node);
    if preds.len() == 1 {
        Some(program.cfg.node(program.cfg.edge(preds[0]).from).data)
    } else {
        None
    }
}

/// Finds the memory operand defining the jump destination register, walking
/// backward through single-predecessor chains.
fn find_memory_operand(
    program: &Program,
    b: BlockId,
    jump_addr: u64,
) -> Option<(MemRef, InsnId, BlockId)> {
    let last = program.block(b).last_insn()?;
    let op0 = program.insn(last).operands.first()?;
    match op0.kind {
        OperandKind::Mem(m) => Some((m, last, b)),
        OperandKind::Reg(target) => {
            let mut b_prev = b;
            loop {
                let mut clobbered = false;
                let def = find_last_definition(program, target, b_prev, &mut clobbered, jump_addr);
                if clobbered {
                    return None;
                }
                if let Some(def) = def {
                    let mem = program.insn(def).operands.first().and_then(|o| o.mem().copied());
                    return mem.map(|m| (m, def, b_prev));
                }
                b_prev = single_predecessor(program, b_prev)?;
            }
        }
        _ => None,
    }
}

/// Finds `CMP imm, index` upstream of `from` (inclusive), following
/// single-predecessor chains. Returns 0 when not provable.
fn find_imm_cmp(program: &Program, b: BlockId, from: InsnId, index: Reg, jump_addr: u64) -> i64 {
    let block = program.block(b);
    let start = block.insns.iter().position(|&i| i == from).unwrap_or(0);
    for &insn in block.insns[..=start].iter().rev() {
        let i = program.insn(insn);
        if i.family == Family::Cmp {
            if let Some(r) = i.operands.get(1).and_then(|o| o.reg()) {
                if r.name == index.name {
                    return match i.operands.first().and_then(|o| o.imm()) {
                        Some(imm) => imm,
                        // Compared against a register: not provable.
                        None => 0,
                    };
                }
            }
        }
        if modifies_reg(program, insn, index, jump_addr) {
            return 0;
        }
    }
    match single_predecessor(program, b) {
        Some(pred) => match program.block(pred).last_insn() {
            Some(last) => find_imm_cmp(program, pred, last, index, jump_addr),
            None => 0,
        },
        None => 0,
    }
}

/// Where an address falls inside a function.
enum TargetHit {
    Start(BlockId),
    Middle(BlockId),
    NotFound,
}

fn find_target_block(program: &Program, function: FunctionId, addr: u64) -> TargetHit {
    for &b in &program.function(function).blocks {
        let block = program.block(b);
        let (first, last) = match (block.first_insn(), block.last_insn()) {
            (Some(f), Some(l)) => (program.insn(f).address, program.insn(l).address),
            _ => continue,
        };
        if first == addr {
            return TargetHit::Start(b);
        }
        if first < addr && addr <= last {
            return TargetHit::Middle(b);
        }
    }
    TargetHit::NotFound
}

/// Splits a block at `address`; the tail keeps the original successors and
/// a unique fall-through edge joins head to tail.
fn split_block(program: &mut Program, b_src: BlockId, address: u64) -> Option<BlockId> {
    let split_pos = program
        .block(b_src)
        .insns
        .iter()
        .position(|&i| program.insn(i).address == address)?;
    let function = program.block(b_src).function;
    let moved: Vec<InsnId> = program.block(b_src).insns[split_pos..].to_vec();
    program.block_mut(b_src).insns.truncate(split_pos);

    let b_dst = program.block_starting_at(function, moved[0]);
    for insn in moved {
        program.add_insn_to_block(insn, b_dst);
    }

    let src_node = program.block(b_src).cfg_node;
    let dst_node = program.block(b_dst).cfg_node;
    let out: Vec<_> = program.cfg.out_edges(src_node).to_vec();
    for e in out {
        let to = program.cfg.edge(e).to;
        let data = program.cfg.edge(e).data;
        program.cfg.add_edge(dst_node, to, data);
        program.cfg.remove_edge(e);
    }
    let _ = program.cfg.add_unique_edge(src_node, dst_node, None);

    log::debug!(
        "block {} has been split at 0x{:X}, new block: {}",
        program.block(b_src).id,
        address,
        program.block(b_dst).id
    );
    Some(b_dst)
}

/// Tries to solve the indirect branch terminating `b`.
fn solve_block(program: &mut Program, b: BlockId) {
    let last = match program.block(b).last_insn() {
        Some(i) => i,
        None => return,
    };
    let jump_addr = program.insn(last).address;

    let (mem, mem_insn, _mem_block) = match find_memory_operand(program, b, jump_addr) {
        Some(found) => found,
        None => {
            log::debug!(
                "no definition found for branch in block {}, at address 0x{:X}",
                program.block(b).id,
                jump_addr
            );
            return;
        }
    };

    // Expected shape: absolute table base with an index register.
    let index = match (mem.base, mem.offset, mem.index) {
        (None, offset, Some(index)) if offset != 0 => index,
        _ => {
            log::debug!(
                "definition has bad format for branch in block {}, at address 0x{:X}",
                program.block(b).id,
                jump_addr
            );
            return;
        }
    };

    let mem_block = program.insn(mem_insn).block.unwrap_or(b);
    let cmp_barrier = program.insn(mem_insn).address;
    let imm = find_imm_cmp(program, mem_block, mem_insn, index, cmp_barrier);
    if imm <= 0 {
        log::debug!(
            "no CMP value found for branch in block {}, at address 0x{:X}",
            program.block(b).id,
            jump_addr
        );
        return;
    }

    let function = program.block(b).function;
    let scale = mem.scale as usize;
    let mut outcome = 0i32;
    for i in 0..=imm {
        let slot = mem.offset as u64 + (i as u64) * scale as u64;
        let dst_addr = match read_table_slot(program, slot, scale) {
            Some(addr) => addr,
            None => {
                outcome = -1;
                continue;
            }
        };
        match find_target_block(program, function, dst_addr) {
            TargetHit::Start(dst) => {
                let from = program.block(b).cfg_node;
                let to = program.block(dst).cfg_node;
                let _ = program.cfg.add_unique_edge(from, to, None);
                if outcome == 0 {
                    outcome = 1;
                }
                log::debug!(
                    "attached block {} to {}",
                    program.block(b).id,
                    program.block(dst).id
                );
            }
            TargetHit::Middle(dst) => {
                if let Some(tail) = split_block(program, dst, dst_addr) {
                    let from = program.block(b).cfg_node;
                    let to = program.block(tail).cfg_node;
                    let _ = program.cfg.add_unique_edge(from, to, None);
                    if outcome == 0 {
                        outcome = 1;
                    }
                } else {
                    outcome = -1;
                }
            }
            TargetHit::NotFound => {
                outcome = -1;
                log::debug!(
                    "no block found at address 0x{:X} for branch in block {}, at address 0x{:X}",
                    dst_addr,
                    program.block(b).id,
                    jump_addr
                );
            }
        }
    }

    if outcome == 1 {
        log::debug!("indirect branch at 0x{:X} solved", jump_addr);
        let anno = &mut program.insn_mut(last).annotations;
        anno.remove(Annotations::IBNOTSOLVE);
        *anno |= Annotations::IBSOLVE;
    } else {
        log::debug!("indirect branch at 0x{:X} not solved", jump_addr);
    }
}

/// Reads one little-endian table slot from the file image.
fn read_table_slot(program: &Program, addr: u64, size: usize) -> Option<u64> {
    let image = program.image.as_ref()?;
    let bytes = image.read(addr, size)?;
    let mut value = 0u64;
    for &byte in bytes.iter().rev() {
        value = (value << 8) | byte as u64;
    }
    Some(value)
}
