use crate::{common::*, report::*};

/// Turns raw compiler output into a [CompilationReport].
///
/// Implementations are bound to one compiler output format. The parse must be
/// strict: output that does not match the format is an error rather than an
/// empty report.
pub trait ReportParser
where
    Self: fmt::Debug + Send + Sync,
{
    /// Parses the captured stdout and stderr of a compiler invocation.
    fn parse_output(&self, text: &str) -> Result<CompilationReport>;

    /// Parses the per-operation log file written next to the compiled model.
    fn parse_operation_log(&self, text: &str) -> Result<Vec<OperationSummary>>;

    /// Parses the compiler output and merges the operation log into the report
    /// when one is given.
    fn parse_with_log(&self, text: &str, log: Option<&str>) -> Result<CompilationReport> {
        let mut report = self.parse_output(text)?;
        if let Some(log) = log {
            let operations = self
                .parse_operation_log(log)
                .context("failed to parse the operation log")?;
            if !operations.is_empty() {
                report.operations = operations;
            }
        }
        Ok(report)
    }
}
