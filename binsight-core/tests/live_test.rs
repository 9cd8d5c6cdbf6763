// Live register analysis tests
mod utils;

use binsight_core::analysis::live_registers::LiveRegisterAnalyzer;
use utils::*;

#[test]
fn liveness_across_a_branch() {
    // B0 defines r3 and branches; B1 reads it; B2 returns.
    let mut program = analyzed(vec![
        mov_imm(100, 5, gp(3)),
        jcc(104, 112),
        mov_reg(108, gp(3), gp(4)),
        ret(112),
    ]);
    let f = fct(&program, "f");
    LiveRegisterAnalyzer::compute(&mut program, f);

    let b0 = program.block(block_at(&program, 100)).id;
    let b1 = program.block(block_at(&program, 108)).id;
    let b2 = program.block(block_at(&program, 112)).id;

    let arch = program.arch.clone();
    let live = program.function(f).live_registers.as_ref().unwrap();
    let r3 = arch.reg_id(gp(3));
    let r4 = arch.reg_id(gp(4));
    let rax = arch.reg_id(gp(0));
    let rdi = arch.reg_id(gp(7));

    // r3 flows from its definition into the read.
    assert!(live.is_out(b0, r3));
    assert!(live.is_in(b1, r3));
    // Defined before any use: not live into the entry.
    assert!(!live.is_in(b0, r3));
    // r4 is only written.
    assert!(!live.is_in(b1, r4));

    // The entry block uses the argument registers.
    assert!(live.is_in(b0, rdi));

    // The exit block keeps the return register alive.
    assert!(live.is_out(b2, rax));
    assert!(live.is_in(b1, rax));
}

#[test]
fn registers_standardize_across_widths() {
    let arch = test_arch();
    // Same name, same family: one logical register.
    assert_eq!(arch.standardize(xmm(2)), ymm(2));
    assert_eq!(arch.reg_id(xmm(2)), arch.reg_id(ymm(2)));
    assert_eq!(arch.standardize(gp32(5)), gp(5));
    // Distinct names stay distinct.
    assert_ne!(arch.reg_id(gp(4)), arch.reg_id(gp(5)));
    // The id space is dense and bounded.
    assert!(arch.reg_id(ymm(15)) < arch.nb_registers());
    assert_eq!(arch.reg_id(arch.pc), 0);
}

#[test]
fn vector_alias_liveness() {
    // A write to the 256-bit register covers a later 128-bit read.
    let mut program = analyzed(vec![
        with_ops(
            code(100, binsight_core::program::insn::Family::Mov),
            &[src_imm(0), dst_reg(ymm(2))],
        ),
        jcc(104, 112),
        with_ops(
            code(108, binsight_core::program::insn::Family::Mov),
            &[src_reg(xmm(2)), dst_reg(xmm(3))],
        ),
        ret(112),
    ]);
    let f = fct(&program, "f");
    LiveRegisterAnalyzer::compute(&mut program, f);

    let b0 = program.block(block_at(&program, 100)).id;
    let arch = program.arch.clone();
    let live = program.function(f).live_registers.as_ref().unwrap();
    assert!(live.is_out(b0, arch.reg_id(ymm(2))));
    assert!(live.is_out(b0, arch.reg_id(xmm(2))));
}

#[test]
fn computation_is_cached() {
    let mut program = analyzed(vec![mov_imm(100, 5, gp(3)), ret(104)]);
    let f = fct(&program, "f");
    LiveRegisterAnalyzer::compute(&mut program, f);
    assert!(program.function(f).live_registers.is_some());
    // Second call reuses the cache.
    LiveRegisterAnalyzer::compute(&mut program, f);
    assert!(program.function(f).live_registers.is_some());
}
