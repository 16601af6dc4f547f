//! Accelerator compiler output contract.
//!
//! The compiler is treated as a black box. Its textual output is turned into a
//! [CompilationReport] by a [ReportParser], so that a change in the compiler's
//! output format only touches the parser adapter.

mod common;
pub mod edgetpu;
pub mod parser;
pub mod report;

pub use edgetpu::EdgeTpuParser;
pub use parser::ReportParser;
pub use report::{CompilationReport, OperationStatus, OperationSummary};
