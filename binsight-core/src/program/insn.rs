//! Instruction Model
//!
//! This module defines the decoded-instruction representation consumed by the
//! analyses. Instructions arrive fully decoded from an external disassembler;
//! the core never parses bytes. The per-file `Vec<Instruction>` is the ground
//! truth for the lexical order ("the next instruction").
//!
//! # Memory Optimizations
//! - `Family` uses `#[repr(u8)]` to save 3 bytes per instruction
//! - `operands` uses `SmallVec<[Operand; 4]>` (most instructions have ≤4 operands)
//! - Handles (`InsnId`, `LabelId`, …) are `u32` instead of pointers

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::program::arch::Reg;

/// Handle on an instruction in the file sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InsnId(pub u32);

/// Handle on a function label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(pub u32);

bitflags! {
    /// Per-instruction annotation bitset.
    ///
    /// `JUMP`, `CALL`, `RTRN`, `CONDITIONAL` and the section flags are set by
    /// the disassembler according to instruction semantics; `BEGIN_BLOCK`,
    /// `BEGIN_PROC`, `HANDLER_EX`, `IBSOLVE` and `IBNOTSOLVE` are produced by
    /// the flow analysis.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Annotations: u32 {
        /// First instruction of a basic block (branch target or forced split).
        const BEGIN_BLOCK  = 1 << 0;
        /// First instruction of a function.
        const BEGIN_PROC   = 1 << 1;
        /// Branch instruction.
        const JUMP         = 1 << 2;
        /// Call instruction.
        const CALL         = 1 << 3;
        /// Return instruction.
        const RTRN         = 1 << 4;
        /// Control may also fall through to the next instruction.
        const CONDITIONAL  = 1 << 5;
        /// Call to a handler (exit) function: treated as a terminator.
        const HANDLER_EX   = 1 << 6;
        /// Function exit.
        const EX           = 1 << 7;
        /// Early exit.
        const EARLY_EX     = 1 << 8;
        /// Potential exit.
        const POTENTIAL_EX = 1 << 9;
        /// Natural (fall-off) exit.
        const NATURAL_EX   = 1 << 10;
        /// Instruction located in a patched section.
        const PATCHED      = 1 << 11;
        /// Instruction moved by the patcher.
        const PATCHMOV     = 1 << 12;
        /// Instruction added by the patcher.
        const PATCHNEW     = 1 << 13;
        /// Instruction in a standard code section.
        const STDCODE      = 1 << 14;
        /// External function stub (e.g. PLT entry).
        const EXTFCT       = 1 << 15;
        /// Indirect branch solved by the CMP idiom.
        const IBSOLVE      = 1 << 16;
        /// Indirect branch the solver could not resolve.
        const IBNOTSOLVE   = 1 << 17;
    }
}

/// Opcode family classification.
///
/// # Memory Optimization
/// Uses `#[repr(u8)]` to reduce size from the default enum size to 1 byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Family {
    Jump = 0,
    Call = 1,
    Return = 2,
    Mov = 3,
    Lea = 4,
    Cmp = 5,
    Test = 6,
    Xchg = 7,
    Nop = 8,
    Add = 9,
    /// Scalar integer subtraction.
    Sub = 10,
    /// Packed floating-point subtraction (SUBP[SD] and variants).
    SubPacked = 11,
    /// Packed integer subtraction (PSUB[BWDQ] and variants).
    PackedSub = 12,
    Xor = 13,
    /// Packed compare-for-equality (PCMPEQ[BWDQ] and variants).
    PackedCmpEq = 14,
    /// Fused multiply-add.
    Fma = 15,
    /// Fused multiply-subtract.
    Fms = 16,
    Load = 17,
    Store = 18,
    Other = 19,
}

/// Operand direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Src = 0,
    Dst = 1,
    Both = 2,
}

/// Memory operand: `offset(segment: base, index, scale)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRef {
    pub segment: Option<Reg>,
    pub base: Option<Reg>,
    pub index: Option<Reg>,
    pub scale: u8,
    pub offset: i64,
}

/// Operand payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    Reg(Reg),
    Mem(MemRef),
    Imm(i64),
    /// Code pointer (direct branch/call target address).
    Ptr(u64),
}

/// Instruction operand with its direction flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub kind: OperandKind,
    pub direction: Direction,
}

impl Operand {
    pub fn src(kind: OperandKind) -> Self {
        Operand {
            kind,
            direction: Direction::Src,
        }
    }

    pub fn dst(kind: OperandKind) -> Self {
        Operand {
            kind,
            direction: Direction::Dst,
        }
    }

    pub fn is_src(&self) -> bool {
        matches!(self.direction, Direction::Src | Direction::Both)
    }

    pub fn is_dst(&self) -> bool {
        matches!(self.direction, Direction::Dst | Direction::Both)
    }

    pub fn reg(&self) -> Option<Reg> {
        match self.kind {
            OperandKind::Reg(r) => Some(r),
            _ => None,
        }
    }

    pub fn mem(&self) -> Option<&MemRef> {
        match &self.kind {
            OperandKind::Mem(m) => Some(m),
            _ => None,
        }
    }

    pub fn imm(&self) -> Option<i64> {
        match self.kind {
            OperandKind::Imm(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self.kind, OperandKind::Ptr(_))
    }
}

/// Decoded instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    /// Address in the original binary.
    pub address: u64,
    /// Byte size.
    pub size: u8,
    /// Opcode family.
    pub family: Family,
    /// Operands in encoding order.
    pub operands: SmallVec<[Operand; 4]>,
    /// Annotation bitset.
    pub annotations: Annotations,
    /// Function label covering this instruction.
    pub label: LabelId,
    /// Containing basic block, set by the flow analysis.
    pub block: Option<crate::program::block::BlockId>,
    /// Instruction targeted by this branch, if resolved.
    pub branch: Option<InsnId>,
}

impl Instruction {
    pub fn has(&self, flags: Annotations) -> bool {
        self.annotations.intersects(flags)
    }

    /// First pointer operand, i.e. the direct branch destination.
    pub fn ptr_operand(&self) -> Option<u64> {
        self.operands.iter().find_map(|o| match o.kind {
            OperandKind::Ptr(addr) => Some(addr),
            _ => None,
        })
    }

    /// True for instructions after which control cannot fall through.
    pub fn is_unconditional_branch(&self) -> bool {
        self.has(Annotations::RTRN)
            || self.has(Annotations::HANDLER_EX)
            || (self.has(Annotations::JUMP) && !self.has(Annotations::CONDITIONAL))
    }
}
