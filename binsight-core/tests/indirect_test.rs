// Indirect branch solver tests
mod utils;

use binsight_core::analysis::AnalysisPipeline;
use binsight_core::program::insn::Annotations;
use utils::*;

/// Little-endian 64-bit jump table.
fn table(addrs: &[u64]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for &a in addrs {
        bytes.extend_from_slice(&a.to_le_bytes());
    }
    bytes
}

#[test]
fn cmp_indexed_jump_table_is_solved() {
    // mov k, r1; cmp 3, r1; jcc default; mov table(, r1, 8), r2; jmp r2.
    let specs = vec![
        mov_imm(100, 7, gp(1)),
        cmp_imm(104, 3, gp(1)),
        jcc(108, 136),
        with_ops(
            code(112, binsight_core::program::insn::Family::Mov),
            &[src_mem(None, Some(gp(1)), 8, 0x1000), dst_reg(gp(2))],
        ),
        jmp_reg(116, gp(2)),
        ret(120),
        ret(124),
        ret(128),
        ret(132),
        ret(136),
    ];
    let mut program = build_full(
        test_arch(),
        specs,
        &[],
        Some((0x1000, table(&[120, 124, 128, 132]))),
    );
    AnalysisPipeline::analyze_all(&mut program).unwrap();

    let jmp_insn = program.insn_at(116).unwrap();
    assert!(program.insn(jmp_insn).has(Annotations::IBSOLVE));
    assert!(!program.insn(jmp_insn).has(Annotations::IBNOTSOLVE));

    let jmp_block = block_at(&program, 112);
    let succs = successors(&program, jmp_block);
    for target in [120, 124, 128, 132] {
        assert!(succs.contains(&block_at(&program, target)));
    }
    // The default case flows from the guard, not from the indirect jump.
    let guard = block_at(&program, 100);
    assert_eq!(edge_count(&program, guard, block_at(&program, 136)), 1);
    assert!(!succs.contains(&block_at(&program, 136)));
}

#[test]
fn mid_block_target_splits_the_block() {
    let specs = vec![
        mov_imm(100, 7, gp(1)),
        cmp_imm(104, 1, gp(1)),
        jcc(108, 128),
        with_ops(
            code(112, binsight_core::program::insn::Family::Mov),
            &[src_mem(None, Some(gp(1)), 8, 0x2000), dst_reg(gp(2))],
        ),
        jmp_reg(116, gp(2)),
        // One block covering 120..124 before the split.
        mov_imm(120, 1, gp(3)),
        ret(124),
        ret(128),
    ];
    let mut program = build_full(
        test_arch(),
        specs,
        &[],
        Some((0x2000, table(&[120, 124]))),
    );
    AnalysisPipeline::analyze_all(&mut program).unwrap();

    let jmp_insn = program.insn_at(116).unwrap();
    assert!(program.insn(jmp_insn).has(Annotations::IBSOLVE));

    // The table target inside the block split it in two.
    let head = block_at(&program, 120);
    let tail = block_at(&program, 124);
    assert_ne!(head, tail);
    assert_eq!(program.block(head).insns.len(), 1);
    assert_eq!(edge_count(&program, head, tail), 1);

    let jmp_block = block_at(&program, 112);
    let succs = successors(&program, jmp_block);
    assert!(succs.contains(&head));
    assert!(succs.contains(&tail));
}

#[test]
fn unsolvable_jump_keeps_the_pessimistic_annotation() {
    // No memory image: the table cannot be read.
    let specs = vec![
        mov_imm(100, 7, gp(1)),
        cmp_imm(104, 3, gp(1)),
        jcc(108, 124),
        with_ops(
            code(112, binsight_core::program::insn::Family::Mov),
            &[src_mem(None, Some(gp(1)), 8, 0x1000), dst_reg(gp(2))],
        ),
        jmp_reg(116, gp(2)),
        ret(120),
        ret(124),
    ];
    let mut program = build_full(test_arch(), specs, &[], None);
    AnalysisPipeline::analyze_all(&mut program).unwrap();

    let jmp_insn = program.insn_at(116).unwrap();
    assert!(program.insn(jmp_insn).has(Annotations::IBNOTSOLVE));
    assert!(!program.insn(jmp_insn).has(Annotations::IBSOLVE));

    // No invented successors.
    let jmp_block = block_at(&program, 112);
    assert!(successors(&program, jmp_block).is_empty());
}

#[test]
fn clobbered_register_aborts_the_search() {
    // The destination register is rewritten between the load and the jump.
    let specs = vec![
        mov_imm(100, 7, gp(1)),
        cmp_imm(104, 3, gp(1)),
        jcc(108, 128),
        with_ops(
            code(112, binsight_core::program::insn::Family::Mov),
            &[src_mem(None, Some(gp(1)), 8, 0x1000), dst_reg(gp(2))],
        ),
        mov_imm(116, 0, gp(2)),
        jmp_reg(120, gp(2)),
        ret(124),
        ret(128),
    ];
    let mut program = build_full(
        test_arch(),
        specs,
        &[],
        Some((0x1000, table(&[124, 124, 124, 124]))),
    );
    AnalysisPipeline::analyze_all(&mut program).unwrap();

    let jmp_insn = program.insn_at(120).unwrap();
    // The mov of an immediate is still a definition of the register; it
    // has no memory source, so the pattern match fails.
    assert!(program.insn(jmp_insn).has(Annotations::IBNOTSOLVE));
    assert!(!program.insn(jmp_insn).has(Annotations::IBSOLVE));
}
