//! Data Dependency Graph
//!
//! Register-level data dependencies over an ordered instruction sequence
//! (a block, a path, or the concatenated path blocks of a loop): the DDG is
//! a multigraph whose nodes carry instructions and whose edges carry a
//! dependency kind (`RAW`, `WAR`, `WAW`), a loop-iteration distance (0 for
//! the same iteration, 1 for the previous one) and a latency range.
//!
//! # Construction
//! Three maps keyed by standardized register identity
//! (`family * 256 + name`) are built first: the writers and readers of each
//! register in instruction order, and the rank of every instruction
//! (1-based). Dependency-breaking instructions (a register-to-register
//! SUB/SUBP/PSUB/XOR/PCMPEQ whose both sources are the same register) are
//! treated as pure writes: their reads are ignored.
//!
//! - **RAW/WAW**: the nearest earlier writer wins (distance 0); with no
//!   earlier writer, the last writer of the sequence provides the value of
//!   the previous iteration (distance 1).
//! - **WAR**: *every* reader is retained, distance decided by rank order.
//!
//! The connected-component index of the graph is maintained on every
//! insertion; a distance-0 edge removes its destination from the entry set
//! of its component.
//!
//! Function- and loop-wide DDGs with several paths accumulate edges in a
//! flat list first and insert them in one pass, so nodes unify across
//! paths.

use std::collections::{BTreeMap, HashMap};

use crate::graph::{Graph, NodeId};
use crate::program::arch::Latency;
use crate::program::block::BlockId;
use crate::program::function::{FunctionId, LoopId};
use crate::program::insn::{Family, InsnId, OperandKind};
use crate::program::Program;

/// Default maximum number of paths/cycles explored per query.
pub const DDG_MAX_PATHS: usize = 1000;

/// Dependency kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DepKind {
    Raw = 0,
    War = 1,
    Waw = 2,
}

/// Edge payload of a DDG.
#[derive(Debug, Clone, Copy)]
pub struct DataDependence {
    pub kind: DepKind,
    /// 0: same iteration, 1: previous iteration.
    pub distance: u8,
    pub latency: Latency,
}

/// A data dependency graph.
pub type Ddg = Graph<InsnId, DataDependence>;

/// Flat dependency record used when merging several paths into one DDG.
#[derive(Debug, Clone, Copy)]
struct FlatEdge {
    src: InsnId,
    dst: InsnId,
    kind: DepKind,
    distance: u8,
}

/// Read/write/rank maps of one instruction sequence.
struct DdgContext {
    rd: BTreeMap<u32, Vec<InsnId>>,
    wr: BTreeMap<u32, Vec<InsnId>>,
    rank: HashMap<InsnId, usize>,
}

/// Graph under construction, with its instruction-to-node index.
struct DdgBuilder {
    graph: Ddg,
    insn2node: HashMap<InsnId, NodeId>,
}

impl DdgBuilder {
    fn new() -> Self {
        DdgBuilder {
            graph: Graph::new(),
            insn2node: HashMap::new(),
        }
    }

    fn node(&mut self, insn: InsnId) -> NodeId {
        match self.insn2node.get(&insn) {
            Some(&n) => n,
            None => {
                let n = self.graph.add_node(insn);
                self.insn2node.insert(insn, n);
                n
            }
        }
    }

    fn connect(&mut self, src: InsnId, dst: InsnId, kind: DepKind, distance: u8) {
        let src_node = self.node(src);
        let dst_node = self.node(dst);
        self.graph.add_edge(
            src_node,
            dst_node,
            DataDependence {
                kind,
                distance,
                latency: Latency::default(),
            },
        );
        // A same-iteration dependency makes the destination an inner node
        // of its component.
        if distance == 0 {
            self.graph.remove_cc_entry(dst_node);
        }
    }
}

/// Where the construction sends its dependencies.
enum Sink<'a> {
    Graph(&'a mut DdgBuilder),
    Edges(&'a mut Vec<FlatEdge>),
}

impl Sink<'_> {
    fn emit(&mut self, src: InsnId, dst: InsnId, kind: DepKind, distance: u8) {
        match self {
            Sink::Graph(builder) => builder.connect(src, dst, kind, distance),
            Sink::Edges(edges) => edges.push(FlatEdge {
                src,
                dst,
                kind,
                distance,
            }),
        }
    }
}

/// Register-to-register instruction always producing the same result
/// regardless of its source value: treated as a pure write.
fn breaks_dependency(program: &Program, insn: InsnId) -> bool {
    let i = program.insn(insn);
    if !matches!(
        i.family,
        Family::Sub | Family::SubPacked | Family::PackedSub | Family::Xor | Family::PackedCmpEq
    ) {
        return false;
    }
    match (
        i.operands.first().and_then(|o| o.reg()),
        i.operands.get(1).and_then(|o| o.reg()),
    ) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn fill_context(program: &Program, insns: &[InsnId]) -> DdgContext {
    let mut ctxt = DdgContext {
        rd: BTreeMap::new(),
        wr: BTreeMap::new(),
        rank: HashMap::new(),
    };
    for (pos, &insn) in insns.iter().enumerate() {
        ctxt.rank.insert(insn, pos + 1);
        let i = program.insn(insn);
        for op in &i.operands {
            match op.kind {
                OperandKind::Reg(r) => record(program, &mut ctxt, op.is_src(), op.is_dst(), false, r, insn),
                OperandKind::Mem(m) => {
                    if let Some(base) = m.base {
                        record(program, &mut ctxt, op.is_src(), op.is_dst(), true, base, insn);
                    }
                    if let Some(index) = m.index {
                        record(program, &mut ctxt, op.is_src(), op.is_dst(), true, index, insn);
                    }
                }
                _ => {}
            }
        }
    }
    ctxt
}

fn record(
    program: &Program,
    ctxt: &mut DdgContext,
    is_src: bool,
    is_dst: bool,
    in_memory: bool,
    reg: crate::program::arch::Reg,
    insn: InsnId,
) {
    let key = program.arch.reg_key(reg);

    if breaks_dependency(program, insn) {
        // Only the write side survives a dependency-breaking idiom.
        if is_dst && !in_memory {
            ctxt.wr.entry(key).or_default().push(insn);
        }
        return;
    }

    // A register inside a memory expression is always read.
    if in_memory || is_src {
        ctxt.rd.entry(key).or_default().push(insn);
    }
    if !in_memory && is_dst {
        ctxt.wr.entry(key).or_default().push(insn);
    }
}

/// RAW and WAW share their shape: nearest earlier writer, else the last
/// writer at distance 1.
fn insert_raw_or_waw(ctxt: &DdgContext, sink: &mut Sink, dst: InsnId, key: u32, kind: DepKind) {
    let dst_rank = ctxt.rank[&dst];
    let writers = match ctxt.wr.get(&key) {
        Some(w) if !w.is_empty() => w,
        _ => return,
    };
    for &src in writers.iter().rev() {
        if ctxt.rank[&src] >= dst_rank {
            continue;
        }
        sink.emit(src, dst, kind, 0);
        return;
    }
    // Value produced by the previous iteration.
    let src = *writers.last().unwrap_or(&dst);
    sink.emit(src, dst, kind, 1);
}

/// WAR keeps every reader, not only the nearest.
fn insert_war(ctxt: &DdgContext, sink: &mut Sink, dst: InsnId, key: u32) {
    let dst_rank = ctxt.rank[&dst];
    let readers = match ctxt.rd.get(&key) {
        Some(r) => r,
        None => return,
    };
    for &src in readers.iter().rev() {
        let distance = if ctxt.rank[&src] >= dst_rank { 1 } else { 0 };
        sink.emit(src, dst, DepKind::War, distance);
    }
}

/// Builds the dependencies of an instruction sequence into `sink`.
fn build_ddg(program: &Program, insns: &[InsnId], sink: &mut Sink, only_raw: bool) {
    if insns.is_empty() {
        return;
    }
    let ctxt = fill_context(program, insns);

    for (&key, readers) in &ctxt.rd {
        for &insn in readers {
            insert_raw_or_waw(&ctxt, sink, insn, key, DepKind::Raw);
        }
    }
    if !only_raw {
        for (&key, writers) in &ctxt.wr {
            for &insn in writers {
                insert_war(&ctxt, sink, insn, key);
                insert_raw_or_waw(&ctxt, sink, insn, key, DepKind::Waw);
            }
        }
    }
}

/// Fills edge latencies from the architecture tables.
fn set_latencies(program: &Program, ddg: &mut Ddg) {
    let edge_ids: Vec<_> = ddg.edge_ids().collect();
    for e in edge_ids {
        let (src, dst) = {
            let edge = ddg.edge(e);
            (ddg.node(edge.from).data, ddg.node(edge.to).data)
        };
        let latency = program.arch.ddg_latency(program.insn(src), program.insn(dst));
        ddg.edge_data_mut(e).latency = latency;
    }
}

// ---------------------------------------------------------------------------
// Public builders

/// DDG of an arbitrary instruction sequence.
pub fn ddg_for_insns(program: &Program, insns: &[InsnId], only_raw: bool) -> Ddg {
    let mut builder = DdgBuilder::new();
    build_ddg(program, insns, &mut Sink::Graph(&mut builder), only_raw);
    let mut ddg = builder.graph;
    set_latencies(program, &mut ddg);
    ddg
}

/// DDG of one basic block.
pub fn ddg_for_block(program: &Program, block: BlockId, only_raw: bool) -> Ddg {
    ddg_for_insns(program, &program.block(block).insns, only_raw)
}

/// DDG of one path (ordered array of blocks).
pub fn ddg_for_path(program: &Program, path: &[BlockId], only_raw: bool) -> Ddg {
    ddg_for_insns(program, &path_insns(program, path), only_raw)
}

fn path_insns(program: &Program, path: &[BlockId]) -> Vec<InsnId> {
    let mut insns = Vec::new();
    for &b in path {
        insns.extend_from_slice(&program.block(b).insns);
    }
    insns
}

/// One DDG per path of a function.
pub fn ddgs_for_function_paths(
    program: &mut Program,
    function: FunctionId,
    only_raw: bool,
) -> Vec<Ddg> {
    let already = program.function(function).paths.is_some();
    if !already {
        crate::analysis::paths::compute_function_paths(program, function);
    }
    let paths = program.function(function).paths.clone().unwrap_or_default();
    let ddgs = paths
        .iter()
        .map(|p| ddg_for_path(program, p, only_raw))
        .collect();
    if !already {
        crate::analysis::paths::free_function_paths(program, function);
    }
    ddgs
}

/// One DDG per path of a loop.
pub fn ddgs_for_loop_paths(program: &mut Program, l: LoopId, only_raw: bool) -> Vec<Ddg> {
    let already = program.loop_(l).paths.is_some();
    if !already {
        crate::analysis::paths::compute_loop_paths(program, l);
    }
    let paths = program.loop_(l).paths.clone().unwrap_or_default();
    let ddgs = paths
        .iter()
        .map(|p| ddg_for_path(program, p, only_raw))
        .collect();
    if !already {
        crate::analysis::paths::free_loop_paths(program, l);
    }
    ddgs
}

/// Whole-function DDG: path DDGs merged into a single graph.
pub fn ddg_for_function(program: &mut Program, function: FunctionId, only_raw: bool) -> Ddg {
    let already = program.function(function).paths.is_some();
    if !already {
        crate::analysis::paths::compute_function_paths(program, function);
    }
    let paths = program.function(function).paths.clone().unwrap_or_default();
    let ddg = merge_paths(program, &paths, only_raw);
    if !already {
        crate::analysis::paths::free_function_paths(program, function);
    }
    ddg
}

/// Whole-loop DDG: path DDGs merged into a single graph.
pub fn ddg_for_loop(program: &mut Program, l: LoopId, only_raw: bool) -> Ddg {
    let already = program.loop_(l).paths.is_some();
    if !already {
        crate::analysis::paths::compute_loop_paths(program, l);
    }
    let paths = program.loop_(l).paths.clone().unwrap_or_default();
    let ddg = merge_paths(program, &paths, only_raw);
    if !already {
        crate::analysis::paths::free_loop_paths(program, l);
    }
    ddg
}

fn merge_paths(program: &Program, paths: &[Vec<BlockId>], only_raw: bool) -> Ddg {
    let mut builder = DdgBuilder::new();
    if paths.len() == 1 {
        // Single path: build directly.
        let insns = path_insns(program, &paths[0]);
        build_ddg(program, &insns, &mut Sink::Graph(&mut builder), only_raw);
    } else {
        // Accumulate flat edges per path, then insert once so instructions
        // shared across paths unify into single nodes.
        let mut edges: Vec<FlatEdge> = Vec::new();
        for path in paths {
            let insns = path_insns(program, path);
            build_ddg(program, &insns, &mut Sink::Edges(&mut edges), only_raw);
        }
        for e in edges {
            builder.connect(e.src, e.dst, e.kind, e.distance);
        }
    }
    let mut ddg = builder.graph;
    set_latencies(program, &mut ddg);
    ddg
}

// ---------------------------------------------------------------------------
// RecMII

/// Recurrence minimum initiation interval: over every elementary cycle of
/// RAW dependencies, the maximum of `Σ latency / Σ distance`, computed for
/// the minimum and maximum latencies independently. Cycles with zero total
/// distance contribute nothing.
///
/// `max_paths == 0` selects [`DDG_MAX_PATHS`].
pub fn rec_mii(ddg: &Ddg, max_paths: usize) -> (f32, f32) {
    let cap = if max_paths == 0 { DDG_MAX_PATHS } else { max_paths };
    let mut best_min = 0.0f32;
    let mut best_max = 0.0f32;

    let raw_only = |e: &crate::graph::GraphEdge<DataDependence>| e.data.kind == DepKind::Raw;
    let mut on_cycle = |edges: &[crate::graph::EdgeId]| {
        let mut sum_min = 0u32;
        let mut sum_max = 0u32;
        let mut sum_distance = 0u32;
        for &e in edges {
            let dep = &ddg.edge(e).data;
            sum_min += dep.latency.min as u32;
            sum_max += dep.latency.max as u32;
            sum_distance += dep.distance as u32;
        }
        if sum_distance == 0 {
            return;
        }
        let min = sum_min as f32 / sum_distance as f32;
        let max = sum_max as f32 / sum_distance as f32;
        if best_min < min {
            best_min = min;
        }
        if best_max < max {
            best_max = max;
        }
    };
    ddg.enumerate_cycles(cap, &raw_only, &mut on_cycle);

    (best_min, best_max)
}

// ---------------------------------------------------------------------------
// Critical paths

/// Longest-latency paths of a DDG, tracked independently for minimum and
/// maximum latency values.
#[derive(Debug, Clone, Default)]
pub struct CriticalPaths {
    pub min_length: f32,
    pub min_paths: Vec<Vec<InsnId>>,
    pub max_length: f32,
    pub max_paths: Vec<Vec<InsnId>>,
}

/// Enumerates the simple paths from every component entry (capped per
/// entry) and keeps the longest under each latency metric. Between two
/// nodes linked by parallel edges, the heaviest edge counts.
///
/// `max_paths == 0` selects [`DDG_MAX_PATHS`].
pub fn critical_paths(ddg: &mut Ddg, max_paths: usize) -> CriticalPaths {
    let cap = if max_paths == 0 { DDG_MAX_PATHS } else { max_paths };
    let mut result = CriticalPaths::default();

    let entries: Vec<NodeId> = ddg
        .connected_components()
        .iter()
        .flat_map(|cc| cc.entry_nodes.iter().copied())
        .collect();

    for entry in entries {
        let graph = &*ddg;
        let mut on_path = |nodes: &[NodeId]| {
            let mut len_min = 0.0f32;
            let mut len_max = 0.0f32;
            for pair in nodes.windows(2) {
                let (mut best_min, mut best_max) = (0.0f32, 0.0f32);
                for &e in graph.out_edges(pair[0]) {
                    let edge = graph.edge(e);
                    if edge.to == pair[1] {
                        best_min = best_min.max(edge.data.latency.min as f32);
                        best_max = best_max.max(edge.data.latency.max as f32);
                    }
                }
                len_min += best_min;
                len_max += best_max;
            }
            let insns: Vec<InsnId> = nodes.iter().map(|&n| graph.node(n).data).collect();
            if len_min > result.min_length {
                result.min_length = len_min;
                result.min_paths = vec![insns.clone()];
            } else if len_min == result.min_length && result.min_length > 0.0 {
                result.min_paths.push(insns.clone());
            }
            if len_max > result.max_length {
                result.max_length = len_max;
                result.max_paths = vec![insns.clone()];
            } else if len_max == result.max_length && result.max_length > 0.0 {
                result.max_paths.push(insns);
            }
        };
        graph.enumerate_paths(entry, cap, &mut on_path);
    }
    result
}
