// Control flow construction tests
mod utils;

use binsight_core::program::builder::ProgramBuilder;
use binsight_core::program::insn::Annotations;
use binsight_core::program::AnalyzeFlags;
use utils::*;

#[test]
fn fallthrough_and_conditional_branch() {
    // A: plain; B: conditional jump to C; C: return.
    let program = analyzed(vec![
        mov_imm(100, 1, gp(3)),
        with_new_block(jcc(104, 108)),
        ret(108),
    ]);

    let f = fct(&program, "f");
    assert_eq!(program.function(f).blocks.len(), 3);

    let a = block_at(&program, 100);
    let b = block_at(&program, 104);
    let c = block_at(&program, 108);

    assert_eq!(edge_count(&program, a, b), 1);
    // Jump and fall-through both reach C.
    assert_eq!(edge_count(&program, b, c), 2);
    assert!(program.cg.edge_ids().next().is_none());

    // A conditional terminator has at least two outgoing edges.
    assert!(successors(&program, b).len() >= 2);

    // One component, entered at A only.
    let components = program.function(f).components.as_ref().unwrap();
    assert_eq!(components.len(), 1);
    assert_eq!(components[0], vec![a]);
}

#[test]
fn blocks_split_only_at_targets_and_terminators() {
    // Without a forced split, the leading instructions share one block.
    let program = analyzed(vec![
        mov_imm(100, 1, gp(3)),
        jcc(104, 108),
        ret(108),
    ]);
    let f = fct(&program, "f");
    assert_eq!(program.function(f).blocks.len(), 2);
    let head = block_at(&program, 100);
    assert_eq!(program.block(head).insns.len(), 2);
}

#[test]
fn unconditional_jump_suppresses_fallthrough() {
    let program = analyzed(vec![
        jmp(100, 108),
        mov_imm(104, 1, gp(3)),
        ret(108),
    ]);
    let a = block_at(&program, 100);
    let b = block_at(&program, 104);
    let c = block_at(&program, 108);
    assert_eq!(edge_count(&program, a, b), 0);
    assert_eq!(edge_count(&program, a, c), 1);
    // An unconditional jump edge leads to the branch target.
    let last = program.block(a).last_insn().unwrap();
    assert_eq!(program.insn(last).branch, program.block(c).first_insn());
}

#[test]
fn call_creates_call_graph_edge() {
    let program = analyzed(vec![
        call(100, 200),
        ret(104),
        with_label(ret(200), "callee"),
    ]);
    let f = fct(&program, "f");
    let callee = fct(&program, "callee");
    let from = program.function(f).cg_node;
    let found = program
        .cg
        .successors(from)
        .any(|n| program.cg.node(n).data == callee);
    assert!(found);

    // The call returns: its block falls through to the next one.
    let a = block_at(&program, 100);
    let b = block_at(&program, 104);
    assert_eq!(edge_count(&program, a, b), 1);
}

#[test]
fn exit_function_call_terminates_block() {
    let program = {
        let specs = vec![
            call(100, 200),
            mov_imm(104, 1, gp(3)),
            ret(108),
            with_label(ret(200), "exit"),
        ];
        let mut program = build_full(test_arch(), specs, &["exit"], None);
        binsight_core::analysis::AnalysisPipeline::analyze_all(&mut program).unwrap();
        program
    };
    let call_insn = program.insn_at(100).unwrap();
    assert!(program.insn(call_insn).has(Annotations::HANDLER_EX));

    // No fall-through out of a handler call.
    let a = block_at(&program, 100);
    let b = block_at(&program, 104);
    assert_eq!(edge_count(&program, a, b), 0);
}

#[test]
fn exit_function_matches_external_label_suffix() {
    let specs = vec![
        call(100, 200),
        ret(104),
        with_label(ret(200), "exit@plt"),
    ];
    let mut program = build_full(test_arch(), specs, &["exit"], None);
    binsight_core::analysis::AnalysisPipeline::analyze_all(&mut program).unwrap();
    let call_insn = program.insn_at(100).unwrap();
    assert!(program.insn(call_insn).has(Annotations::HANDLER_EX));
}

#[test]
fn component_merge_keeps_entries_in_address_order() {
    // Two entries A and B share the successor C.
    let program = analyzed(vec![
        jmp(100, 108),
        jmp(104, 108),
        ret(108),
    ]);
    let f = fct(&program, "f");
    let a = block_at(&program, 100);
    let b = block_at(&program, 104);

    let components = program.function(f).components.as_ref().unwrap();
    assert_eq!(components.len(), 1);
    assert_eq!(components[0], vec![a, b]);
}

#[test]
fn analysis_flags_make_stages_idempotent() {
    let mut program = build(vec![
        mov_imm(100, 1, gp(3)),
        ret(104),
    ]);
    binsight_core::analysis::AnalysisPipeline::analyze_all(&mut program).unwrap();
    assert!(program.analyze_flags.contains(AnalyzeFlags::CFG));
    let blocks = program.blocks.len();
    let loops = program.loops.len();

    // Re-running must not create anything.
    binsight_core::analysis::AnalysisPipeline::analyze_all(&mut program).unwrap();
    assert_eq!(program.blocks.len(), blocks);
    assert_eq!(program.loops.len(), loops);
}

#[test]
fn summary_serializes_to_json() {
    let program = analyzed(vec![
        mov_imm(100, 0, gp(1)),
        jcc(104, 104),
        ret(108),
    ]);
    let summary = binsight_core::analysis::FileSummary::collect(&program);
    assert_eq!(summary.functions.len(), 1);
    assert_eq!(summary.functions[0].name, "f");
    assert_eq!(summary.functions[0].loops.len(), 1);

    let json = summary.to_json().unwrap();
    assert!(json.contains("\"name\": \"f\""));
}

#[test]
fn unlabeled_stream_is_rejected() {
    let mut builder = ProgramBuilder::new(test_arch());
    builder.push(mov_imm(100, 1, gp(3)));
    assert!(builder.build().is_err());
}

#[test]
fn jump_annotations_match_edges() {
    // For every unconditional jump edge, the target block starts at the
    // branch destination.
    let program = analyzed(vec![
        jmp(100, 112),
        mov_imm(104, 1, gp(1)),
        ret(108),
        ret(112),
    ]);
    for e in program.cfg.edge_ids() {
        let edge = program.cfg.edge(e);
        if let Some(insn) = edge.data {
            let i = program.insn(insn);
            if i.is_unconditional_branch() && i.has(Annotations::JUMP) {
                let to_block = program.cfg.node(edge.to).data;
                assert_eq!(i.branch, program.block(to_block).first_insn());
            }
        }
    }
}
