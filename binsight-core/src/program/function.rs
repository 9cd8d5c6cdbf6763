//! Functions and Loops
//!
//! A function owns an ordered set of blocks, its loops, connected components
//! and the demand-computed caches (paths, live registers, SSA). A loop keeps
//! its entries, exits, body blocks and its place in the loop-nesting forest.

use smallvec::SmallVec;

use crate::analysis::live_registers::LiveRegisters;
use crate::analysis::ssa::SsaForm;
use crate::graph::NodeId;
use crate::program::block::BlockId;
use crate::program::insn::{InsnId, LabelId};

/// Handle on a function in the file arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u32);

/// Handle on a loop in the file arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopId(pub u32);

/// Function: ordered blocks plus analysis results.
#[derive(Debug)]
pub struct Function {
    pub id: FunctionId,
    /// Label naming the function.
    pub label: LabelId,
    /// First instruction (the anchor the function was created at).
    pub first_insn: InsnId,
    /// Blocks in creation order; the main entry block is kept first.
    pub blocks: Vec<BlockId>,
    /// Node of this function in the file call graph.
    pub cg_node: NodeId,
    /// Loops of this function in creation order.
    pub loops: Vec<LoopId>,
    /// Connected components: one entry-block list per component, the
    /// component of the first instruction first. `None` until computed.
    pub components: Option<Vec<Vec<BlockId>>>,
    /// Acyclic CFG paths. `None` until computed (or when above the cap).
    pub paths: Option<Vec<Vec<BlockId>>>,
    /// Virtual exit block, alive only during post-dominance computation.
    pub virtual_exit: Option<BlockId>,
    /// Live-register dataflow results.
    pub live_registers: Option<LiveRegisters>,
    /// SSA form.
    pub ssa: Option<SsaForm>,
    /// Emptied patch-section placeholder, skipped by every analysis.
    pub dead: bool,
}

impl Function {
    pub fn new(id: FunctionId, label: LabelId, first_insn: InsnId, cg_node: NodeId) -> Self {
        Function {
            id,
            label,
            first_insn,
            blocks: Vec::new(),
            cg_node,
            loops: Vec::new(),
            components: None,
            paths: None,
            virtual_exit: None,
            live_registers: None,
            ssa: None,
            dead: false,
        }
    }

    /// Main entry block: the block of the function's first instruction.
    pub fn entry_block(&self) -> Option<BlockId> {
        self.blocks.first().copied()
    }

    /// Drops every demand-computed cache. Called on structural edits.
    pub fn invalidate_caches(&mut self) {
        self.components = None;
        self.paths = None;
        self.live_registers = None;
        self.ssa = None;
    }
}

/// Loop record.
#[derive(Debug, Clone)]
pub struct Loop {
    /// File-global loop id.
    pub id: u32,
    pub function: FunctionId,
    /// Entry blocks; the header is first, re-entries follow.
    pub entries: SmallVec<[BlockId; 2]>,
    /// Blocks ending an iteration.
    pub exits: SmallVec<[BlockId; 2]>,
    /// Blocks of the body, inner-loop blocks included.
    pub blocks: Vec<BlockId>,
    /// Loop-nesting forest.
    pub parent: Option<LoopId>,
    pub children: Vec<LoopId>,
    /// Acyclic paths through the loop body. `None` until computed.
    pub paths: Option<Vec<Vec<BlockId>>>,
    /// Memory-access groups, filled by downstream grouping analyses.
    pub groups: Vec<Vec<InsnId>>,
}

impl Loop {
    pub fn new(id: u32, function: FunctionId, header: BlockId) -> Self {
        let mut entries = SmallVec::new();
        entries.push(header);
        Loop {
            id,
            function,
            entries,
            exits: SmallVec::new(),
            blocks: Vec::new(),
            parent: None,
            children: Vec::new(),
            paths: None,
            groups: Vec::new(),
        }
    }

    /// Loop header (first entry).
    pub fn header(&self) -> BlockId {
        self.entries[0]
    }

    /// Entries belonging to the loop body: the header and re-entry blocks.
    /// Outside predecessors recorded by the entry fixup are excluded, so
    /// single-entry checks key on the points control enters through.
    pub fn body_entries(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.entries
            .iter()
            .copied()
            .filter(|e| self.blocks.contains(e))
    }

    /// A loop is innermost iff it has no children in the nesting forest.
    pub fn is_innermost(&self) -> bool {
        self.children.is_empty()
    }
}
