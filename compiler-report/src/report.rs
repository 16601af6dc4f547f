use crate::common::*;

/// The structured result of one accelerator compiler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationReport {
    /// The compiler version string, if the compiler printed one.
    pub compiler_version: Option<String>,
    /// Whether the compiler reported a successful compilation.
    pub success: bool,
    pub total_ops: usize,
    pub ops_on_accelerator: usize,
    pub ops_on_fallback_cpu: usize,
    /// The number of accelerator subgraphs the model was split into.
    pub subgraphs: Option<usize>,
    /// The compiled model path as reported by the compiler.
    pub output_model: Option<PathBuf>,
    /// The per-operation log file path as reported by the compiler.
    pub log_path: Option<PathBuf>,
    /// Per-operator mapping summary, if the compiler printed one.
    pub operations: Vec<OperationSummary>,
}

impl CompilationReport {
    /// Fraction of operations mapped onto the accelerator.
    ///
    /// An empty model counts as fully offloaded.
    pub fn offload_ratio(&self) -> f64 {
        if self.total_ops == 0 {
            1.0
        } else {
            self.ops_on_accelerator as f64 / self.total_ops as f64
        }
    }

    /// True if the compilation succeeded and no operation falls back to the CPU.
    pub fn is_fully_offloaded(&self) -> bool {
        self.success && self.ops_on_fallback_cpu == 0
    }

    /// The operators that were not mapped onto the accelerator.
    pub fn unmapped_operations(&self) -> impl Iterator<Item = &OperationSummary> {
        self.operations
            .iter()
            .filter(|summary| !summary.status.is_mapped())
    }
}

impl Display for CompilationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}/{} ops on accelerator, {} on cpu, {:.1}% offload)",
            if self.success { "succeeded" } else { "failed" },
            self.ops_on_accelerator,
            self.total_ops,
            self.ops_on_fallback_cpu,
            self.offload_ratio() * 100.0
        )
    }
}

/// One row of the compiler's per-operator table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub operator: String,
    pub count: usize,
    pub status: OperationStatus,
}

/// Where an operator is executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OperationStatus {
    /// Mapped onto the accelerator.
    Mapped,
    /// Left on the CPU, with the reason given by the compiler.
    Unmapped { reason: String },
}

impl OperationStatus {
    pub fn is_mapped(&self) -> bool {
        matches!(self, Self::Mapped)
    }
}

impl Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mapped => write!(f, "mapped"),
            Self::Unmapped { reason } => write!(f, "{}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(success: bool, total: usize, accel: usize) -> CompilationReport {
        CompilationReport {
            compiler_version: None,
            success,
            total_ops: total,
            ops_on_accelerator: accel,
            ops_on_fallback_cpu: total - accel,
            subgraphs: None,
            output_model: None,
            log_path: None,
            operations: vec![],
        }
    }

    #[test]
    fn offload_ratio_test() {
        assert_eq!(report(true, 0, 0).offload_ratio(), 1.0);
        assert_eq!(report(true, 4, 3).offload_ratio(), 0.75);
        assert!(report(true, 4, 4).is_fully_offloaded());
        assert!(!report(true, 4, 3).is_fully_offloaded());
        assert!(!report(false, 4, 4).is_fully_offloaded());
    }
}
