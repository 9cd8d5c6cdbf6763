// SSA construction tests
mod utils;

use binsight_core::analysis::ssa::SsaAnalyzer;
use utils::*;

#[test]
fn loop_header_phi_links_both_definitions() {
    // P: mov 5, r1; H: add r2, r1 (redefines r1); cmp; jcc H; X: ret.
    let mut program = analyzed(vec![
        mov_imm(100, 5, gp(1)),
        add(104, gp(2), gp(1)),
        cmp_imm(108, 10, gp(1)),
        jcc(112, 104),
        ret(116),
    ]);
    let f = fct(&program, "f");
    SsaAnalyzer::compute(&mut program, f);

    let h = block_at(&program, 104);
    let form = program.function(f).ssa.as_ref().unwrap();
    let h_id = program.block(h).id;

    let phis: Vec<_> = form.phis(h_id).collect();
    assert_eq!(phis.len(), 1, "one phi for r1 at the loop header");
    let phi = form.insn(phis[0]);
    assert_eq!(phi.outputs.len(), 1);
    assert_eq!(phi.outputs[0].reg, program.arch.standardize(gp(1)));

    // One operand per CFG predecessor.
    assert_eq!(phi.phi_operand_count(), 2);

    // Operand 0 comes from the mov before the loop, operand 1 from the add
    // inside it.
    let mov_id = program.insn_at(100).unwrap();
    let add_id = program.insn_at(104).unwrap();
    let def0 = phi.operands[0].and_then(|o| o.def).unwrap();
    let def1 = phi.operands[1].and_then(|o| o.def).unwrap();
    assert_eq!(form.insn(def0).insn, Some(mov_id));
    assert_eq!(form.insn(def1).insn, Some(add_id));

    // The phi output links back to the outside-loop definition.
    let out_def = phi.outputs[0].def.unwrap();
    assert_eq!(form.insn(out_def).insn, Some(mov_id));

    // Every used version has a producer (or is the initial version 0).
    for insn in &form.insns {
        for op in insn.operands.iter().flatten() {
            assert!(op.def.is_some() || op.index == 0);
        }
    }
}

#[test]
fn instruction_decorations_follow_versions() {
    let mut program = analyzed(vec![
        mov_imm(100, 5, gp(1)),
        add(104, gp(2), gp(1)),
        cmp_imm(108, 10, gp(1)),
        jcc(112, 104),
        ret(116),
    ]);
    let f = fct(&program, "f");
    SsaAnalyzer::compute(&mut program, f);
    let form = program.function(f).ssa.as_ref().unwrap();

    let add_id = program.insn_at(104).unwrap();
    let cmp_id = program.insn_at(108).unwrap();
    let add_ssa = form
        .insns
        .iter()
        .find(|i| i.insn == Some(add_id))
        .unwrap();
    let cmp_ssa = form
        .insns
        .iter()
        .find(|i| i.insn == Some(cmp_id))
        .unwrap();

    // The add writes r1 and the flags.
    assert_eq!(add_ssa.outputs.len(), 2);
    // A compare only sets flags: no SSA output.
    assert!(cmp_ssa.outputs.is_empty());

    // The compare reads the version the add produced.
    let r1 = program.arch.standardize(gp(1));
    let add_out = add_ssa.outputs.iter().find(|o| o.reg == r1).unwrap();
    let cmp_read = cmp_ssa.operands[2].unwrap();
    assert_eq!(cmp_read.reg, r1);
    assert_eq!(cmp_read.index, add_out.index);
}

#[test]
fn invariant_constant_phi_is_removed() {
    // The loop re-loads the same constant: the phi degrades to a copy.
    let mut program = analyzed(vec![
        mov_imm(100, 5, gp(1)),
        add(104, gp(1), gp(2)),
        mov_imm(108, 5, gp(1)),
        jcc(112, 104),
        ret(116),
    ]);
    let f = fct(&program, "f");
    SsaAnalyzer::compute(&mut program, f);

    let h = block_at(&program, 104);
    let form = program.function(f).ssa.as_ref().unwrap();
    let phis: Vec<_> = form.phis(program.block(h).id).collect();

    let r1 = program.arch.standardize(gp(1));
    let phi = phis
        .iter()
        .map(|&p| form.insn(p))
        .find(|p| p.outputs[0].reg == r1)
        .expect("phi for r1");
    assert_eq!(phi.phi_operand_count(), 1, "phi reduced to an affectation");
    let def = phi.operands[0].and_then(|o| o.def).unwrap();
    assert_eq!(form.insn(def).insn, program.insn_at(100));
}

#[test]
fn entry_block_phi_carries_version_zero() {
    // r1 is both an argument-carrying register and redefined in the loop
    // made of the entry block itself.
    let mut program = analyzed(vec![
        add(100, gp(2), gp(1)),
        jcc(104, 100),
        ret(108),
    ]);
    let f = fct(&program, "f");
    SsaAnalyzer::compute(&mut program, f);
    let form = program.function(f).ssa.as_ref().unwrap();

    let entry = program.function(f).entry_block().unwrap();
    let phis: Vec<_> = form.phis(program.block(entry).id).collect();
    assert!(!phis.is_empty(), "entry block of the self loop holds phis");
    let r1 = program.arch.standardize(gp(1));
    let phi = phis
        .iter()
        .map(|&p| form.insn(p))
        .find(|p| p.outputs[0].reg == r1)
        .expect("phi for r1");
    // One of the operands is the initial value at function entry.
    assert!(phi
        .operands
        .iter()
        .flatten()
        .any(|o| o.index == 0 && o.def.is_none()));
}

#[test]
fn ssa_is_cached_per_function() {
    let mut program = analyzed(vec![mov_imm(100, 5, gp(1)), ret(104)]);
    let f = fct(&program, "f");
    SsaAnalyzer::compute(&mut program, f);
    let before = program.function(f).ssa.as_ref().unwrap().insns.len();
    SsaAnalyzer::compute(&mut program, f);
    assert_eq!(program.function(f).ssa.as_ref().unwrap().insns.len(), before);
}
