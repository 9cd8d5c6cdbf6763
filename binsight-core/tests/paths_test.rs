// Path enumeration tests
mod utils;

use binsight_core::analysis::paths::{self, PathsOutcome};
use binsight_core::graph::Graph;
use utils::*;

fn diamond() -> binsight_core::program::Program {
    analyzed(vec![
        jcc(100, 108),
        jmp(104, 112),
        mov_reg(108, gp(1), gp(1)),
        ret(112),
    ])
}

#[test]
fn function_paths_of_a_diamond() {
    let mut program = diamond();
    let f = fct(&program, "f");
    let outcome = paths::compute_function_paths(&mut program, f);
    assert!(matches!(outcome, PathsOutcome::Computed(2)));

    let a = block_at(&program, 100);
    let b = block_at(&program, 104);
    let c = block_at(&program, 108);
    let d = block_at(&program, 112);
    let paths = program.function(f).paths.as_ref().unwrap();
    assert_eq!(paths.len(), 2);
    assert!(paths.contains(&vec![a, b, d]));
    assert!(paths.contains(&vec![a, c, d]));

    // Second request: already cached.
    assert_eq!(
        paths::compute_function_paths(&mut program, f),
        PathsOutcome::AlreadyComputed
    );

    paths::free_function_paths(&mut program, f);
    assert!(program.function(f).paths.is_none());
}

#[test]
fn path_count_without_materializing() {
    let program = diamond();
    let f = fct(&program, "f");
    assert_eq!(paths::function_path_count(&program, f), Some(2));
}

#[test]
fn multi_entry_function_is_not_considered() {
    // Two separate entries reaching a shared block.
    let mut program = analyzed(vec![
        jmp(100, 108),
        jmp(104, 108),
        ret(108),
    ]);
    let f = fct(&program, "f");
    assert_eq!(
        paths::compute_function_paths(&mut program, f),
        PathsOutcome::MultipleEntries
    );
    assert!(program.function(f).paths.is_none());
}

#[test]
fn loop_paths_use_the_body_subgraph() {
    let mut program = analyzed(vec![
        mov_imm(100, 0, gp(1)),
        mov_imm(104, 0, gp(2)),
        add(108, gp(1), gp(2)),
        jcc(112, 108),
        jcc(116, 104),
        ret(120),
    ]);
    let f = fct(&program, "f");
    let ih = block_at(&program, 108);
    let inner = *program
        .function(f)
        .loops
        .iter()
        .find(|&&l| program.loop_(l).header() == ih)
        .unwrap();

    let outcome = paths::compute_loop_paths(&mut program, inner);
    assert!(matches!(outcome, PathsOutcome::Computed(1)));
    assert_eq!(program.loop_(inner).paths.as_ref().unwrap()[0], vec![ih]);

    // The isolation edges were restored.
    let oh = block_at(&program, 104);
    assert_eq!(edge_count(&program, oh, ih), 1);
    let ot = block_at(&program, 116);
    assert_eq!(edge_count(&program, ih, ot), 1);
}

#[test]
fn enumeration_cap_is_monotone() {
    // Two chained diamonds: four maximal paths.
    let mut g: Graph<u32, ()> = Graph::new();
    let nodes: Vec<_> = (0..7).map(|i| g.add_node(i)).collect();
    // First diamond 0 -> {1, 2} -> 3, second 3 -> {4, 5} -> 6.
    g.add_edge(nodes[0], nodes[1], ());
    g.add_edge(nodes[0], nodes[2], ());
    g.add_edge(nodes[1], nodes[3], ());
    g.add_edge(nodes[2], nodes[3], ());
    g.add_edge(nodes[3], nodes[4], ());
    g.add_edge(nodes[3], nodes[5], ());
    g.add_edge(nodes[4], nodes[6], ());
    g.add_edge(nodes[5], nodes[6], ());

    let mut capped = Vec::new();
    let complete = g.enumerate_paths(nodes[0], 2, &mut |p| capped.push(p.to_vec()));
    assert!(!complete);
    assert_eq!(capped.len(), 2);

    let mut all = Vec::new();
    assert!(g.enumerate_paths(nodes[0], 100, &mut |p| all.push(p.to_vec())));
    assert_eq!(all.len(), 4);

    // Raising the cap only extends the result set.
    for p in &capped {
        assert!(all.contains(p));
    }

    assert_eq!(g.count_paths(nodes[0], 100), 4);
    assert_eq!(g.count_paths(nodes[0], 3), 3);
}
