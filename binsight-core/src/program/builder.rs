//! Program Ingestion
//!
//! [`ProgramBuilder`] is the handoff point between the external disassembler
//! and the analysis core: the disassembler pushes one [`InsnSpec`] per
//! decoded instruction (address, size, family, operands, semantic
//! annotations, covering function label, optional branch-target address) and
//! `build` produces a [`Program`] with branch targets resolved to handles
//! and the `DISASSEMBLED` flag set.

use std::collections::HashMap;

use anyhow::{bail, Result};
use smallvec::SmallVec;

use crate::program::arch::Arch;
use crate::program::insn::{Annotations, Family, InsnId, Instruction, LabelId, Operand};
use crate::program::{FunctionLabel, LabelKind, MemoryImage, Program};

/// One decoded instruction as delivered by the disassembler.
#[derive(Debug, Clone)]
pub struct InsnSpec {
    pub address: u64,
    pub size: u8,
    pub family: Family,
    pub operands: SmallVec<[Operand; 4]>,
    /// Semantic annotations (`JUMP`, `CALL`, `RTRN`, `CONDITIONAL`, section
    /// flags, exit flags). Flow-produced flags are ignored if present.
    pub annotations: Annotations,
    /// Name of the function label covering this instruction, with its kind.
    pub label: Option<(String, LabelKind)>,
    /// Address of the direct branch destination, if any.
    pub branch_target: Option<u64>,
    /// Synthetic marker forcing a new basic block at this instruction.
    pub new_block: bool,
}

impl InsnSpec {
    pub fn new(address: u64, size: u8, family: Family) -> Self {
        InsnSpec {
            address,
            size,
            family,
            operands: SmallVec::new(),
            annotations: Annotations::empty(),
            label: None,
            branch_target: None,
            new_block: false,
        }
    }
}

/// Builder accumulating the decoded stream of one file.
pub struct ProgramBuilder {
    arch: Arch,
    specs: Vec<InsnSpec>,
    exit_functions: Vec<String>,
    image: Option<MemoryImage>,
}

impl ProgramBuilder {
    pub fn new(arch: Arch) -> Self {
        ProgramBuilder {
            arch,
            specs: Vec::new(),
            exit_functions: Vec::new(),
            image: None,
        }
    }

    pub fn push(&mut self, spec: InsnSpec) -> &mut Self {
        self.specs.push(spec);
        self
    }

    /// Project-level exit-function names. A call to one of them terminates
    /// its block.
    pub fn exit_functions(&mut self, names: &[&str]) -> &mut Self {
        self.exit_functions = names.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Attaches the binary image used by the indirect-branch solver.
    pub fn image(&mut self, base: u64, bytes: Vec<u8>) -> &mut Self {
        self.image = Some(MemoryImage { base, bytes });
        self
    }

    /// Builds the program: interns labels, resolves branch-target addresses
    /// to instruction handles and marks the file as disassembled.
    pub fn build(self) -> Result<Program> {
        let mut program = Program::new(self.arch);
        program.exit_functions = self.exit_functions;
        program.image = self.image;

        let mut label_ids: HashMap<String, LabelId> = HashMap::new();
        let mut addr_to_insn: HashMap<u64, InsnId> = HashMap::new();
        let mut last_addr: Option<u64> = None;
        let mut current_label: Option<LabelId> = None;

        for (idx, spec) in self.specs.iter().enumerate() {
            if let Some(prev) = last_addr {
                if spec.address <= prev {
                    bail!(
                        "instruction addresses must be increasing (0x{:X} after 0x{:X})",
                        spec.address,
                        prev
                    );
                }
            }
            last_addr = Some(spec.address);
            addr_to_insn.insert(spec.address, InsnId(idx as u32));

            if let Some((name, kind)) = &spec.label {
                let next_id = LabelId(program.labels.len() as u32);
                let id = *label_ids.entry(name.clone()).or_insert_with(|| {
                    program.labels.push(FunctionLabel {
                        name: name.clone(),
                        kind: *kind,
                    });
                    next_id
                });
                current_label = Some(id);
            }
            let label = match current_label {
                Some(l) => l,
                // The disassembler labels every code section; an unlabeled
                // instruction is a precondition breach.
                None => return Err(crate::error::CoreError::MissingFunctionLabel(spec.address).into()),
            };

            program.insns.push(Instruction {
                address: spec.address,
                size: spec.size,
                family: spec.family,
                operands: spec.operands.clone(),
                annotations: spec.annotations
                    & !(Annotations::BEGIN_BLOCK
                        | Annotations::BEGIN_PROC
                        | Annotations::HANDLER_EX
                        | Annotations::IBSOLVE
                        | Annotations::IBNOTSOLVE),
                label,
                block: None,
                branch: None,
            });
            if spec.new_block {
                program.new_block_marks.insert(InsnId(idx as u32));
            }
        }

        // Second pass: resolve branch-target addresses. Targets outside the
        // sequence stay pending (indirect or external branches).
        for (idx, spec) in self.specs.iter().enumerate() {
            if let Some(target) = spec.branch_target {
                match addr_to_insn.get(&target) {
                    Some(&t) => program.insns[idx].branch = Some(t),
                    None => log::debug!(
                        "branch at 0x{:08X} targets 0x{:08X}, outside the decoded stream",
                        spec.address,
                        target
                    ),
                }
            }
        }

        program.analyze_flags |= crate::program::AnalyzeFlags::DISASSEMBLED;
        Ok(program)
    }
}
