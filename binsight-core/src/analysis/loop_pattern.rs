//! Loop Pattern Identification
//!
//! Classifies single-entry loops into source-level shapes from the way
//! their exits link back to the entry.

use crate::program::block::BlockId;
use crate::program::function::LoopId;
use crate::program::insn::Annotations;
use crate::program::Program;

/// Kind of link between two blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLink {
    /// Lexical adjacency without an unconditional branch in between.
    Direct,
    ConditionalJump,
    UnconditionalJump,
    None,
}

/// Link from the last instruction of `b1` to the first instruction of `b2`.
pub fn block_link_type(program: &Program, b1: BlockId, b2: BlockId) -> BlockLink {
    let (last, first) = match (program.block(b1).last_insn(), program.block(b2).first_insn()) {
        (Some(l), Some(f)) => (l, f),
        _ => return BlockLink::None,
    };
    let last_insn = program.insn(last);
    let first_addr = program.insn(first).address;

    if !last_insn.is_unconditional_branch()
        && last_insn.address + last_insn.size as u64 == first_addr
    {
        return BlockLink::Direct;
    }
    match last_insn.branch {
        Some(t) if program.insn(t).address == first_addr => {
            if last_insn.has(Annotations::CONDITIONAL) {
                BlockLink::ConditionalJump
            } else {
                BlockLink::UnconditionalJump
            }
        }
        _ => BlockLink::None,
    }
}

/// Recognized loop shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPattern {
    /// One block both entering and exiting the loop.
    While { entry_exit: BlockId },
    /// One exit, distinct from the entry, branching back to it.
    Repeat { entry: BlockId, exit: BlockId },
    /// Several exits, each branching back to the entry.
    MultiRepeat { entry: BlockId },
}

/// Tries to classify a loop. `None` when the shape is not recognized.
pub fn detect(program: &Program, l: LoopId) -> Option<LoopPattern> {
    let lp = program.loop_(l);
    if lp.body_entries().count() != 1 {
        return None;
    }
    let entry = lp.header();

    if lp.exits.len() == 1 {
        let exit = lp.exits[0];
        let link = block_link_type(program, exit, entry);

        if program.block(entry).id == program.block(exit).id && link == BlockLink::None {
            return Some(LoopPattern::While { entry_exit: entry });
        }
        if link == BlockLink::ConditionalJump || link == BlockLink::Direct {
            return Some(LoopPattern::Repeat { entry, exit });
        }
        return None;
    }

    if lp.exits.len() > 1 {
        let all_linked = lp.exits.iter().all(|&exit| {
            let link = block_link_type(program, exit, entry);
            link == BlockLink::ConditionalJump || link == BlockLink::Direct
        });
        if all_linked {
            return Some(LoopPattern::MultiRepeat { entry });
        }
        return None;
    }

    None
}
