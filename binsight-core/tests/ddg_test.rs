// Data dependency graph tests
mod utils;

use binsight_core::analysis::ddg::{self, DepKind};
use binsight_core::program::insn::{Family, InsnId};
use utils::*;

/// All `(src, dst, kind, distance)` tuples of a DDG.
fn edges(ddg: &ddg::Ddg, program: &binsight_core::program::Program) -> Vec<(u64, u64, DepKind, u8)> {
    ddg.edge_ids()
        .map(|e| {
            let edge = ddg.edge(e);
            (
                program.insn(ddg.node(edge.from).data).address,
                program.insn(ddg.node(edge.to).data).address,
                edge.data.kind,
                edge.data.distance,
            )
        })
        .collect()
}

#[test]
fn raw_war_waw_distances() {
    // I1: add r2, r1 (reads and writes r1); I2: mov r1, r3.
    let program = build(vec![add(100, gp(2), gp(1)), mov_reg(104, gp(1), gp(3))]);
    let insns: Vec<InsnId> = (0..2).map(InsnId).collect();

    let ddg = ddg::ddg_for_insns(&program, &insns, false);
    let all = edges(&ddg, &program);

    // Same-iteration flow of r1 into the mov.
    assert!(all.contains(&(100, 104, DepKind::Raw, 0)));
    // The mov reads r1 before the add rewrites it next iteration.
    assert!(all.contains(&(104, 100, DepKind::War, 1)));
    // The add reads its own previous value.
    assert!(all.contains(&(100, 100, DepKind::Raw, 1)));
    // No write-after-write between the two instructions.
    assert!(!all
        .iter()
        .any(|&(s, d, k, _)| k == DepKind::Waw && s != d));

    // WAR completeness: every (writer, reader) pair of r1 is linked.
    assert!(all.contains(&(100, 100, DepKind::War, 1)));
}

#[test]
fn raw_only_variant_skips_war_and_waw() {
    let program = build(vec![add(100, gp(2), gp(1)), mov_reg(104, gp(1), gp(3))]);
    let insns: Vec<InsnId> = (0..2).map(InsnId).collect();
    let ddg = ddg::ddg_for_insns(&program, &insns, true);
    assert!(edges(&ddg, &program)
        .iter()
        .all(|&(_, _, k, _)| k == DepKind::Raw));
}

#[test]
fn distance_zero_needs_an_earlier_writer() {
    let program = build(vec![
        mov_imm(100, 1, gp(1)),
        mov_imm(104, 2, gp(1)),
        mov_reg(108, gp(1), gp(2)),
    ]);
    let insns: Vec<InsnId> = (0..3).map(InsnId).collect();
    let ddg = ddg::ddg_for_insns(&program, &insns, false);
    let all = edges(&ddg, &program);

    // The read binds to the nearest earlier writer only.
    assert!(all.contains(&(104, 108, DepKind::Raw, 0)));
    assert!(!all.contains(&(100, 108, DepKind::Raw, 0)));
    // The two writers chain through a same-iteration WAW.
    assert!(all.contains(&(100, 104, DepKind::Waw, 0)));
}

#[test]
fn dependency_breaking_idiom_ignores_reads() {
    // xor r1, r1 always yields zero: its read of r1 must not create RAW.
    let program = build(vec![
        mov_imm(100, 7, gp(1)),
        with_ops(code(104, Family::Xor), &[src_reg(gp(1)), both_reg(gp(1))]),
        mov_reg(108, gp(1), gp(2)),
    ]);
    let insns: Vec<InsnId> = (0..3).map(InsnId).collect();
    let ddg = ddg::ddg_for_insns(&program, &insns, true);
    let all = edges(&ddg, &program);

    // The zeroing write feeds the mov; the initial mov does not.
    assert!(all.contains(&(104, 108, DepKind::Raw, 0)));
    assert!(!all.iter().any(|&(s, d, k, _)| s == 100 && d == 104 && k == DepKind::Raw));
}

#[test]
fn latencies_come_from_the_uarch_tables() {
    let program = build_full(
        test_arch_with_latencies(),
        vec![
            with_ops(code(100, Family::Fma), &[src_reg(xmm(1)), both_reg(xmm(2))]),
            with_ops(code(104, Family::Fma), &[src_reg(xmm(2)), both_reg(xmm(3))]),
            mov_reg(108, gp(1), gp(2)),
        ],
        &[],
        None,
    );
    let insns: Vec<InsnId> = (0..3).map(InsnId).collect();
    let ddg = ddg::ddg_for_insns(&program, &insns, true);

    // The chained fused-multiply pair uses the late-forwarding latency.
    let mut found = false;
    for e in ddg.edge_ids() {
        let edge = ddg.edge(e);
        let src = program.insn(ddg.node(edge.from).data).address;
        let dst = program.insn(ddg.node(edge.to).data).address;
        if src == 100 && dst == 104 && edge.data.kind == DepKind::Raw {
            assert_eq!(edge.data.latency.min, 2);
            assert_eq!(edge.data.latency.max, 3);
            found = true;
        }
    }
    assert!(found);
}

#[test]
fn rec_mii_trivial_and_self_recurrence() {
    // Acyclic DDG: no recurrence.
    let program = build(vec![mov_imm(100, 1, gp(1)), mov_imm(104, 2, gp(2))]);
    let ddg = ddg::ddg_for_insns(&program, &[InsnId(0), InsnId(1)], true);
    assert_eq!(ddg::rec_mii(&ddg, 0), (0.0, 0.0));

    // Single accumulator: RAW self loop at distance 1, Add latency (1, 2).
    let program = build_full(
        test_arch_with_latencies(),
        vec![add(100, gp(2), gp(1))],
        &[],
        None,
    );
    let ddg = ddg::ddg_for_insns(&program, &[InsnId(0)], true);
    assert_eq!(ddg::rec_mii(&ddg, 0), (1.0, 2.0));
}

#[test]
fn critical_path_follows_the_longest_chain() {
    let program = build_full(
        test_arch_with_latencies(),
        vec![
            mov_imm(100, 5, gp(1)),
            mov_reg(104, gp(1), gp(2)),
            mov_reg(108, gp(2), gp(3)),
        ],
        &[],
        None,
    );
    let insns: Vec<InsnId> = (0..3).map(InsnId).collect();
    let mut ddg = ddg::ddg_for_insns(&program, &insns, true);

    let critical = ddg::critical_paths(&mut ddg, 0);
    assert_eq!(critical.min_length, 2.0);
    assert_eq!(critical.max_length, 2.0);
    assert!(critical.min_paths.contains(&insns));
}

#[test]
fn connected_component_entries_shrink_on_distance_zero() {
    let program = build(vec![
        mov_imm(100, 5, gp(1)),
        mov_reg(104, gp(1), gp(2)),
    ]);
    let mut ddg = ddg::ddg_for_insns(&program, &[InsnId(0), InsnId(1)], true);
    let entry = {
        let components = ddg.connected_components();
        assert_eq!(components.len(), 1);
        // Only the producer remains an entry.
        assert_eq!(components[0].entry_nodes.len(), 1);
        components[0].entry_nodes[0]
    };
    assert_eq!(ddg.node(entry).data, InsnId(0));
}

#[test]
fn block_and_loop_ddgs() {
    let mut program = analyzed(vec![
        mov_imm(100, 0, gp(1)),
        add(104, gp(2), gp(1)),
        cmp_imm(108, 10, gp(1)),
        jcc(112, 104),
        ret(116),
    ]);
    let f = fct(&program, "f");
    let h = block_at(&program, 104);

    let block_ddg = ddg::ddg_for_block(&program, h, true);
    // add -> cmp flow of r1.
    let has_flow = block_ddg.edge_ids().any(|e| {
        let edge = block_ddg.edge(e);
        program.insn(block_ddg.node(edge.from).data).address == 104
            && program.insn(block_ddg.node(edge.to).data).address == 108
            && edge.data.distance == 0
    });
    assert!(has_flow);

    let l = program.function(f).loops[0];
    let loop_ddg = ddg::ddg_for_loop(&mut program, l, true);
    // The loop DDG carries the same-iteration add -> cmp flow and the
    // cross-iteration accumulation of r1.
    let mut cross = false;
    for e in loop_ddg.edge_ids() {
        let edge = loop_ddg.edge(e);
        if edge.from == edge.to && edge.data.distance == 1 {
            cross = true;
        }
    }
    assert!(cross);
    // Paths computed on demand are released afterwards.
    assert!(program.loop_(l).paths.is_none());
}
