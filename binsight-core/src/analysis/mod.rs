//! Analysis Pipeline
//!
//! This module groups the analyses rebuilding program structure from the
//! decoded instruction stream: control flow, indirect branches, dominance,
//! loops, connected components, paths, live registers, SSA and data
//! dependencies.
//!
//! # Pipeline Stages
//! 1. **Control flow**: basic blocks, CFG, CG, indirect-branch resolution
//! 2. **Dominance**: immediate dominators of every block
//! 3. **Loops**: loop identification and nesting forest
//! 4. **Connected components**: weakly connected sub-functions
//! 5. **Post-dominance**: immediate post-dominators over a virtual exit
//!
//! Each stage is guarded by a bit in the file's analysis flags: re-entering
//! a completed stage is a no-op. Paths, live registers, SSA and DDGs are
//! demand-driven and cached on the function/loop/block they describe.

pub mod components;
pub mod control_flow;
pub mod ddg;
pub mod dominance;
pub mod indirect_branch;
pub mod live_registers;
pub mod loop_analysis;
pub mod loop_pattern;
pub mod paths;
pub mod ssa;

// Re-export commonly used types
pub use components::ComponentAnalyzer;
pub use control_flow::ControlFlowAnalyzer;
pub use dominance::DominanceAnalyzer;
pub use live_registers::{LiveRegisterAnalyzer, LiveRegisters};
pub use loop_analysis::LoopAnalyzer;
pub use ssa::SsaAnalyzer;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::program::function::FunctionId;
use crate::program::Program;

/// Fixed-order analysis pipeline.
pub struct AnalysisPipeline;

impl AnalysisPipeline {
    /// Runs every structural stage on the file, in order. Stages already
    /// recorded in the analysis flags are skipped.
    pub fn analyze_all(program: &mut Program) -> Result<()> {
        log::info!("stage: control flow");
        ControlFlowAnalyzer::analyze(program)?;
        log::info!("stage: dominance");
        DominanceAnalyzer::analyze(program);
        log::info!("stage: loops");
        LoopAnalyzer::analyze(program);
        log::info!("stage: connected components");
        ComponentAnalyzer::analyze(program);
        log::info!("stage: post-dominance");
        DominanceAnalyzer::analyze_post(program);
        Ok(())
    }
}

/// Serializable digest of the analysis results of one file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSummary {
    pub functions: Vec<FunctionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSummary {
    pub name: String,
    pub address: u64,
    pub blocks: usize,
    pub components: usize,
    pub loops: Vec<LoopSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSummary {
    pub id: u32,
    pub entries: usize,
    pub exits: usize,
    pub blocks: usize,
    pub innermost: bool,
    pub pattern: Option<String>,
}

impl FileSummary {
    /// Collects the digest of an analyzed file.
    pub fn collect(program: &Program) -> Self {
        let mut functions = Vec::new();
        for f in &program.functions {
            if f.dead {
                continue;
            }
            let loops = f
                .loops
                .iter()
                .map(|&l| {
                    let lp = program.loop_(l);
                    LoopSummary {
                        id: lp.id,
                        entries: lp.entries.len(),
                        exits: lp.exits.len(),
                        blocks: lp.blocks.len(),
                        innermost: lp.is_innermost(),
                        pattern: loop_pattern::detect(program, l).map(|p| {
                            match p {
                                loop_pattern::LoopPattern::While { .. } => "while",
                                loop_pattern::LoopPattern::Repeat { .. } => "repeat",
                                loop_pattern::LoopPattern::MultiRepeat { .. } => "multi-repeat",
                            }
                            .to_string()
                        }),
                    }
                })
                .collect();
            functions.push(FunctionSummary {
                name: program.function_name(f.id).to_string(),
                address: program.insn(f.first_insn).address,
                blocks: f.blocks.len(),
                components: f.components.as_ref().map(Vec::len).unwrap_or(0),
                loops,
            });
        }
        FileSummary { functions }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Demand-driven caches: computes the SSA form of a function together with
/// its prerequisites.
pub fn ensure_ssa(program: &mut Program, function: FunctionId) {
    SsaAnalyzer::compute(program, function);
}

/// Demand-driven caches: computes the live registers of a function.
pub fn ensure_live_registers(program: &mut Program, function: FunctionId) {
    LiveRegisterAnalyzer::compute(program, function);
}
