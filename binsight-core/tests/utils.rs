//! Test Utilities
//!
//! Shared helpers for the integration tests: a compact x86-64 flavoured
//! architecture description, instruction-stream builders and a few CFG
//! assertion helpers.
#![allow(dead_code)]

use std::collections::HashMap;

use binsight_core::analysis::AnalysisPipeline;
use binsight_core::program::arch::{Arch, Latency, Reg, RegTypeInfo, UarchLatencies};
use binsight_core::program::block::BlockId;
use binsight_core::program::builder::{InsnSpec, ProgramBuilder};
use binsight_core::program::function::FunctionId;
use binsight_core::program::insn::{
    Annotations, Direction, Family, MemRef, Operand, OperandKind,
};
use binsight_core::program::{LabelKind, Program};

/// Register type indexes of the test architecture.
pub const GP32: u8 = 0;
pub const GP64: u8 = 1;
pub const XMM: u8 = 2;
pub const YMM: u8 = 3;
pub const IP: u8 = 4;
pub const FLAGS: u8 = 5;

pub fn gp(name: u8) -> Reg {
    Reg::new(GP64, name)
}

pub fn gp32(name: u8) -> Reg {
    Reg::new(GP32, name)
}

pub fn xmm(name: u8) -> Reg {
    Reg::new(XMM, name)
}

pub fn ymm(name: u8) -> Reg {
    Reg::new(YMM, name)
}

pub fn flags_reg() -> Reg {
    Reg::new(FLAGS, 0)
}

/// Compact x86-64 flavoured architecture: 32/64-bit general-purpose bank,
/// 128/256-bit vector bank, instruction pointer and flags. Arithmetic and
/// compares write the flags implicitly.
pub fn test_arch() -> Arch {
    let mut implicit_dst: HashMap<Family, Vec<Reg>> = HashMap::new();
    for family in [
        Family::Add,
        Family::Sub,
        Family::Cmp,
        Family::Test,
        Family::Xor,
    ] {
        implicit_dst.insert(family, vec![flags_reg()]);
    }
    Arch {
        name: "test-x64",
        types: vec![
            RegTypeInfo { family: 0, width: 32 },
            RegTypeInfo { family: 0, width: 64 },
            RegTypeInfo { family: 1, width: 128 },
            RegTypeInfo { family: 1, width: 256 },
            RegTypeInfo { family: 2, width: 64 },
            RegTypeInfo { family: 3, width: 64 },
        ],
        nb_names: 16,
        pc: Reg::new(IP, 0),
        arg_regs: vec![gp(7), gp(6), gp(2), gp(1)],
        return_regs: vec![gp(0)],
        implicit_src: HashMap::new(),
        implicit_dst,
        uarch: None,
    }
}

/// Same architecture with a latency model attached.
pub fn test_arch_with_latencies() -> Arch {
    let mut arch = test_arch();
    let mut per_family = HashMap::new();
    per_family.insert(Family::Mov, Latency::new(1, 1));
    per_family.insert(Family::Add, Latency::new(1, 2));
    per_family.insert(Family::Fma, Latency::new(4, 5));
    per_family.insert(Family::Fms, Latency::new(4, 5));
    arch.uarch = Some(UarchLatencies {
        per_family,
        late_forwarding: Latency::new(2, 3),
        default: Latency::new(0, 0),
    });
    arch
}

// ---------------------------------------------------------------------------
// Operand constructors

pub fn src_reg(r: Reg) -> Operand {
    Operand::src(OperandKind::Reg(r))
}

pub fn dst_reg(r: Reg) -> Operand {
    Operand::dst(OperandKind::Reg(r))
}

pub fn both_reg(r: Reg) -> Operand {
    Operand {
        kind: OperandKind::Reg(r),
        direction: Direction::Both,
    }
}

pub fn src_imm(v: i64) -> Operand {
    Operand::src(OperandKind::Imm(v))
}

pub fn src_mem(base: Option<Reg>, index: Option<Reg>, scale: u8, offset: i64) -> Operand {
    Operand::src(OperandKind::Mem(MemRef {
        segment: None,
        base,
        index,
        scale,
        offset,
    }))
}

// ---------------------------------------------------------------------------
// Instruction constructors

/// Code instruction of 4 bytes in a standard section.
pub fn code(addr: u64, family: Family) -> InsnSpec {
    let mut spec = InsnSpec::new(addr, 4, family);
    spec.annotations = Annotations::STDCODE;
    spec
}

pub fn with_ops(mut spec: InsnSpec, ops: &[Operand]) -> InsnSpec {
    spec.operands = ops.iter().copied().collect();
    spec
}

pub fn with_label(mut spec: InsnSpec, name: &str) -> InsnSpec {
    spec.label = Some((name.to_string(), LabelKind::Code));
    spec
}

/// Forces a basic-block split at this instruction.
pub fn with_new_block(mut spec: InsnSpec) -> InsnSpec {
    spec.new_block = true;
    spec
}

/// Conditional jump to `target`.
pub fn jcc(addr: u64, target: u64) -> InsnSpec {
    let mut spec = code(addr, Family::Jump);
    spec.annotations |= Annotations::JUMP | Annotations::CONDITIONAL;
    spec.branch_target = Some(target);
    spec.operands.push(Operand::src(OperandKind::Ptr(target)));
    spec
}

/// Unconditional jump to `target`.
pub fn jmp(addr: u64, target: u64) -> InsnSpec {
    let mut spec = code(addr, Family::Jump);
    spec.annotations |= Annotations::JUMP;
    spec.branch_target = Some(target);
    spec.operands.push(Operand::src(OperandKind::Ptr(target)));
    spec
}

/// Indirect jump through a register.
pub fn jmp_reg(addr: u64, r: Reg) -> InsnSpec {
    let mut spec = code(addr, Family::Jump);
    spec.annotations |= Annotations::JUMP;
    spec.operands.push(src_reg(r));
    spec
}

/// Call to `target`.
pub fn call(addr: u64, target: u64) -> InsnSpec {
    let mut spec = code(addr, Family::Call);
    spec.annotations |= Annotations::CALL;
    spec.branch_target = Some(target);
    spec.operands.push(Operand::src(OperandKind::Ptr(target)));
    spec
}

/// Return, annotated as a function exit.
pub fn ret(addr: u64) -> InsnSpec {
    let mut spec = code(addr, Family::Return);
    spec.annotations |= Annotations::RTRN | Annotations::EX;
    spec
}

/// `mov imm, reg`.
pub fn mov_imm(addr: u64, value: i64, dst: Reg) -> InsnSpec {
    with_ops(code(addr, Family::Mov), &[src_imm(value), dst_reg(dst)])
}

/// `mov src, dst` between registers.
pub fn mov_reg(addr: u64, src: Reg, dst: Reg) -> InsnSpec {
    with_ops(code(addr, Family::Mov), &[src_reg(src), dst_reg(dst)])
}

/// `add src, dst` (reads and writes `dst`).
pub fn add(addr: u64, src: Reg, dst: Reg) -> InsnSpec {
    with_ops(code(addr, Family::Add), &[src_reg(src), both_reg(dst)])
}

/// `cmp imm, reg`.
pub fn cmp_imm(addr: u64, value: i64, reg: Reg) -> InsnSpec {
    with_ops(code(addr, Family::Cmp), &[src_imm(value), src_reg(reg)])
}

// ---------------------------------------------------------------------------
// Program construction

/// Builds a program with the test architecture; the first instruction gets
/// the function label `f` when none was provided.
pub fn build(specs: Vec<InsnSpec>) -> Program {
    build_full(test_arch(), specs, &[], None)
}

/// Builds and runs the whole structural pipeline.
pub fn analyzed(specs: Vec<InsnSpec>) -> Program {
    let mut program = build(specs);
    AnalysisPipeline::analyze_all(&mut program).expect("analysis succeeds");
    program
}

pub fn build_full(
    arch: Arch,
    mut specs: Vec<InsnSpec>,
    exit_functions: &[&str],
    image: Option<(u64, Vec<u8>)>,
) -> Program {
    if let Some(first) = specs.first_mut() {
        if first.label.is_none() {
            first.label = Some(("f".to_string(), LabelKind::Code));
        }
    }
    let mut builder = ProgramBuilder::new(arch);
    builder.exit_functions(exit_functions);
    if let Some((base, bytes)) = image {
        builder.image(base, bytes);
    }
    for spec in specs {
        builder.push(spec);
    }
    builder.build().expect("stream builds")
}

// ---------------------------------------------------------------------------
// Assertions

/// Function handle by name.
pub fn fct(program: &Program, name: &str) -> FunctionId {
    program
        .functions
        .iter()
        .find(|f| program.function_name(f.id) == name)
        .map(|f| f.id)
        .expect("function exists")
}

/// Block starting at `addr`.
pub fn block_at(program: &Program, addr: u64) -> BlockId {
    program
        .blocks
        .iter()
        .enumerate()
        .find(|(_, b)| {
            b.first_insn()
                .map(|i| program.insn(i).address == addr)
                .unwrap_or(false)
        })
        .map(|(i, _)| BlockId(i as u32))
        .expect("block exists at address")
}

/// CFG successors of a block, in edge order.
pub fn successors(program: &Program, b: BlockId) -> Vec<BlockId> {
    program
        .cfg
        .successors(program.block(b).cfg_node)
        .map(|n| program.cfg.node(n).data)
        .collect()
}

/// Number of CFG edges from `a` to `b`.
pub fn edge_count(program: &Program, a: BlockId, b: BlockId) -> usize {
    successors(program, a).iter().filter(|&&s| s == b).count()
}
