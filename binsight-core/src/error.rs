//! Error Types
//!
//! This module provides the error types of the analysis core using `thiserror`.
//! Almost every failure mode of the analyses is non-fatal and surfaces as an
//! absent cache plus a debug-log message; the variants below cover the few
//! conditions callers must be able to react to.
//!
//! # Error Categories
//! - **Ingestion errors**: malformed instruction streams handed over by the disassembler
//! - **Flow errors**: precondition breaches while building the CFG/CG
//! - **Stage errors**: an analysis invoked on a file missing its prerequisites

use thiserror::Error;

/// Analysis core error types.
///
/// Uses `thiserror` for zero-cost error handling with detailed error messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A code instruction carries no function label.
    ///
    /// The disassembler guarantees every code section starts with a label, so
    /// this is a precondition breach and the current file is abandoned.
    #[error("instruction at 0x{0:08X} has no function label")]
    MissingFunctionLabel(u64),

    /// A jump or call instruction was found outside any function.
    #[error("branch at 0x{0:08X} is not inside a function")]
    BranchOutsideFunction(u64),

    /// The instruction stream handed to the builder is inconsistent.
    ///
    /// Occurs when a branch-target address does not resolve to any
    /// instruction of the sequence, or when addresses are not increasing.
    #[error("malformed instruction stream: {0}")]
    MalformedStream(String),

    /// An analysis was invoked before its prerequisite stage completed.
    ///
    /// Stages normally return silently in this case; this variant is used by
    /// the demand-driven entry points that must report why nothing happened.
    #[error("missing prerequisite stage: {0}")]
    MissingPrerequisite(&'static str),
}

impl From<std::io::Error> for CoreError {
    #[cold] // Error paths are cold
    fn from(err: std::io::Error) -> Self {
        CoreError::MalformedStream(format!("IO error: {}", err))
    }
}
