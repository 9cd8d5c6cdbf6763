//! Program Model
//!
//! [`Program`] is the in-memory representation of one analyzed file: the
//! decoded instruction sequence (ground truth for lexical order), the label
//! table, and the arenas owning functions, blocks and loops, together with
//! the file-wide CFG and call graph. Every analysis result is owned by the
//! entity it describes and handed back by handle.
//!
//! The per-file `analyze_flags` bitset records which pipeline stages already
//! ran; stages are idempotent and return immediately when their bit is set.

pub mod arch;
pub mod block;
pub mod builder;
pub mod function;
pub mod insn;

use std::collections::HashMap;

use bitflags::bitflags;

use crate::graph::Graph;
use crate::program::arch::Arch;
use crate::program::block::{BasicBlock, BlockId};
use crate::program::function::{Function, FunctionId, Loop, LoopId};
use crate::program::insn::{Annotations, Family, InsnId, Instruction, LabelId};

/// External-label suffix appended to names resolved through a PLT stub.
pub const EXTERNAL_LABEL_SUFFIX: &str = "@plt";

bitflags! {
    /// Per-file analysis completion flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AnalyzeFlags: u32 {
        const DISASSEMBLED   = 1 << 0;
        const CFG            = 1 << 1;
        const DOMINANCE      = 1 << 2;
        const LOOPS          = 1 << 3;
        const COMPONENTS     = 1 << 4;
        const POST_DOMINANCE = 1 << 5;
    }
}

/// Kind of a function label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    /// Regular code label.
    Code,
    /// Label of a section added by the binary patcher.
    PatchSection,
}

/// Function label attached to instructions.
#[derive(Debug, Clone)]
pub struct FunctionLabel {
    pub name: String,
    pub kind: LabelKind,
}

/// Read-only view on the bytes of the analyzed binary.
///
/// This is the `getbytes` contract consumed by the indirect-branch solver.
#[derive(Debug, Clone)]
pub struct MemoryImage {
    pub base: u64,
    pub bytes: Vec<u8>,
}

impl MemoryImage {
    pub fn read(&self, addr: u64, len: usize) -> Option<&[u8]> {
        let start = addr.checked_sub(self.base)? as usize;
        let end = start.checked_add(len)?;
        self.bytes.get(start..end)
    }
}

/// One analyzed file.
#[derive(Debug)]
pub struct Program {
    pub arch: Arch,
    /// Decoded instructions in lexical order.
    pub insns: Vec<Instruction>,
    pub labels: Vec<FunctionLabel>,
    pub functions: Vec<Function>,
    pub blocks: Vec<BasicBlock>,
    pub loops: Vec<Loop>,
    /// File-wide control flow graph. Node payload: block handle; edge
    /// payload: origin instruction of the transfer (`None` for synthesized
    /// edges).
    pub cfg: Graph<BlockId, Option<InsnId>>,
    /// Call graph. One node per function.
    pub cg: Graph<FunctionId, ()>,
    /// Project-level exit-function names (calls to them never return).
    pub exit_functions: Vec<String>,
    /// Bytes of the binary, when available.
    pub image: Option<MemoryImage>,
    pub analyze_flags: AnalyzeFlags,
    /// Instructions carrying the synthetic "force new block" marker.
    pub new_block_marks: std::collections::HashSet<InsnId>,
    pub(crate) fct_by_label: HashMap<LabelId, FunctionId>,
    block_index: HashMap<InsnId, BlockId>,
}

impl Program {
    pub fn new(arch: Arch) -> Self {
        Program {
            arch,
            insns: Vec::new(),
            labels: Vec::new(),
            functions: Vec::new(),
            blocks: Vec::new(),
            loops: Vec::new(),
            cfg: Graph::new(),
            cg: Graph::new(),
            exit_functions: Vec::new(),
            image: None,
            analyze_flags: AnalyzeFlags::empty(),
            new_block_marks: std::collections::HashSet::new(),
            fct_by_label: HashMap::new(),
            block_index: HashMap::new(),
        }
    }

    // -------------------------------------------------------------------
    // Arena accessors

    pub fn insn(&self, id: InsnId) -> &Instruction {
        &self.insns[id.0 as usize]
    }

    pub fn insn_mut(&mut self, id: InsnId) -> &mut Instruction {
        &mut self.insns[id.0 as usize]
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.0 as usize]
    }

    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn function_mut(&mut self, id: FunctionId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    pub fn loop_(&self, id: LoopId) -> &Loop {
        &self.loops[id.0 as usize]
    }

    pub fn loop_mut(&mut self, id: LoopId) -> &mut Loop {
        &mut self.loops[id.0 as usize]
    }

    pub fn label(&self, id: LabelId) -> &FunctionLabel {
        &self.labels[id.0 as usize]
    }

    pub fn label_name(&self, id: LabelId) -> &str {
        &self.labels[id.0 as usize].name
    }

    pub fn function_name(&self, id: FunctionId) -> &str {
        self.label_name(self.function(id).label)
    }

    // -------------------------------------------------------------------
    // Construction helpers used by the flow analysis

    /// Creates a function anchored at `first_insn` with a call-graph node,
    /// and indexes it by label.
    pub fn new_function(&mut self, label: LabelId, first_insn: InsnId) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        let cg_node = self.cg.add_node(id);
        self.functions.push(Function::new(id, label, first_insn, cg_node));
        self.fct_by_label.insert(label, id);
        id
    }

    pub fn function_by_label(&self, label: LabelId) -> Option<FunctionId> {
        self.fct_by_label.get(&label).copied()
    }

    /// Returns the block starting at `first_insn`, creating it in `function`
    /// if absent. Block creation is idempotent keyed by the first
    /// instruction, so the flow walk and jump-target resolution can both
    /// "create" the same block.
    pub fn block_starting_at(&mut self, function: FunctionId, first_insn: InsnId) -> BlockId {
        if let Some(&b) = self.block_index.get(&first_insn) {
            return b;
        }
        let id = BlockId(self.blocks.len() as u32);
        let cfg_node = self.cfg.add_node(id);
        let mut block = BasicBlock::new(function, cfg_node);
        block.is_virtual = false;
        self.blocks.push(block);
        self.functions[function.0 as usize].blocks.push(id);
        self.block_index.insert(first_insn, id);
        self.insns[first_insn.0 as usize].block = Some(id);
        id
    }

    /// Creates a virtual block (no instructions) in `function`.
    pub fn new_virtual_block(&mut self, function: FunctionId) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        let cfg_node = self.cfg.add_node(id);
        self.blocks.push(BasicBlock::new(function, cfg_node));
        self.functions[function.0 as usize].blocks.push(id);
        id
    }

    /// Appends an instruction to a block (unless already appended there).
    pub fn add_insn_to_block(&mut self, insn: InsnId, block: BlockId) {
        let b = &mut self.blocks[block.0 as usize];
        if b.insns.last() != Some(&insn) {
            b.insns.push(insn);
        }
        self.insns[insn.0 as usize].block = Some(block);
    }

    /// Refreshes the per-function block numbers of `function`.
    pub fn renumber_blocks(&mut self, function: FunctionId) {
        let blocks = self.functions[function.0 as usize].blocks.clone();
        for (i, b) in blocks.iter().enumerate() {
            self.blocks[b.0 as usize].id = i as u32;
        }
    }

    /// Padding block: non-virtual and made of no-ops only.
    pub fn block_is_padding(&self, id: BlockId) -> bool {
        let b = self.block(id);
        !b.insns.is_empty()
            && b.insns
                .iter()
                .all(|&i| self.insn(i).family == Family::Nop)
    }

    /// Entry blocks of a function: the main entry first, then every other
    /// non-virtual block without incoming CFG edges.
    pub fn entry_blocks(&self, function: FunctionId) -> Vec<BlockId> {
        let f = self.function(function);
        let mut entries = Vec::new();
        if let Some(main) = f.entry_block() {
            entries.push(main);
            for &b in &f.blocks {
                if b != main
                    && !self.block(b).is_virtual
                    && self.cfg.in_edges(self.block(b).cfg_node).is_empty()
                {
                    entries.push(b);
                }
            }
        }
        entries
    }

    /// Creates a loop headed by `header` and makes it the innermost loop of
    /// the header block.
    pub fn new_loop(&mut self, function: FunctionId, header: BlockId) -> LoopId {
        let id = LoopId(self.loops.len() as u32);
        self.loops.push(Loop::new(id.0, function, header));
        self.functions[function.0 as usize].loops.push(id);
        self.blocks[header.0 as usize].loop_ = Some(id);
        id
    }

    /// True when `ancestor` is a proper ancestor of `of` in the loop forest.
    pub fn loop_is_ancestor(&self, ancestor: LoopId, of: LoopId) -> bool {
        let mut cur = self.loop_(of).parent;
        while let Some(l) = cur {
            if l == ancestor {
                return true;
            }
            cur = self.loop_(l).parent;
        }
        false
    }

    /// Matches a callee name against the project exit-function list: exact
    /// match, or match up to the external-label suffix.
    pub fn is_exit_function_name(&self, name: &str) -> bool {
        self.exit_functions.iter().any(|exit| {
            name == exit
                || (name.starts_with(exit.as_str())
                    && &name[exit.len()..] == EXTERNAL_LABEL_SUFFIX)
        })
    }

    /// Address of a block's first instruction (`u64::MAX` for virtual
    /// blocks, which sorts them last).
    pub fn block_address(&self, id: BlockId) -> u64 {
        self.block(id)
            .first_insn()
            .map(|i| self.insn(i).address)
            .unwrap_or(u64::MAX)
    }

    /// Finds the instruction at an exact address.
    pub fn insn_at(&self, address: u64) -> Option<InsnId> {
        self.insns
            .binary_search_by_key(&address, |i| i.address)
            .ok()
            .map(|i| InsnId(i as u32))
    }

    /// Next instruction in lexical order.
    pub fn next_insn(&self, id: InsnId) -> Option<InsnId> {
        let next = id.0 as usize + 1;
        (next < self.insns.len()).then(|| InsnId(next as u32))
    }

    /// Previous instruction in lexical order.
    pub fn prev_insn(&self, id: InsnId) -> Option<InsnId> {
        id.0.checked_sub(1).map(InsnId)
    }

    /// Branch destination of an instruction, when resolved.
    pub fn branch_target(&self, id: InsnId) -> Option<InsnId> {
        self.insn(id).branch
    }

    /// Last instruction of the block, decorated. Helper for annotation
    /// checks at block level.
    pub fn block_last_has(&self, block: BlockId, flags: Annotations) -> bool {
        self.block(block)
            .last_insn()
            .map(|i| self.insn(i).has(flags))
            .unwrap_or(false)
    }
}
