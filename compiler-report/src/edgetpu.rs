//! Adapter for the Edge TPU compiler (version 16 output format).

use crate::{common::*, parser::ReportParser, report::*};

static VERSION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Edge TPU Compiler version (\S+)").unwrap());
static SUCCESS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(Model compiled successfully|Compilation succeeded)").unwrap());
static FAILURE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(Compilation failed|Internal compiler error)").unwrap());
static TOTAL_OPS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Total number of operations:\s*(\d+)").unwrap());
static ACCELERATOR_OPS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^Number of operations that will run on Edge TPU:\s*(\d+)").unwrap()
});
static CPU_OPS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Number of operations that will run on CPU:\s*(\d+)").unwrap());
static SUBGRAPHS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Number of Edge TPU subgraphs:\s*(\d+)").unwrap());
static OUTPUT_MODEL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Output model:\s*(\S+)").unwrap());
static OPERATION_LOG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Operation log:\s*(\S+)").unwrap());
static TABLE_HEADER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*Operator\s+Count\s+Status\s*$").unwrap());
static TABLE_ROW_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([A-Z0-9_]+)\s+(\d+)\s+(\S.*?)\s*$").unwrap());

const MAPPED_STATUS: &str = "Mapped to Edge TPU";

/// Parser for the text printed by `edgetpu_compiler`.
#[derive(Debug, Clone, Default)]
pub struct EdgeTpuParser {
    _private: (),
}

impl EdgeTpuParser {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReportParser for EdgeTpuParser {
    fn parse_output(&self, text: &str) -> Result<CompilationReport> {
        let succeeded = SUCCESS_REGEX.is_match(text);
        let failed = FAILURE_REGEX.is_match(text);
        ensure!(
            succeeded || failed,
            "unrecognized compiler output: no success or failure marker found"
        );
        let success = succeeded && !failed;

        let total = capture_count(&TOTAL_OPS_REGEX, text)?;
        let on_accelerator = capture_count(&ACCELERATOR_OPS_REGEX, text)?;
        let on_cpu = capture_count(&CPU_OPS_REGEX, text)?;

        let (total_ops, ops_on_accelerator, ops_on_fallback_cpu) =
            match (total, on_accelerator, on_cpu) {
                (Some(total), Some(accel), Some(cpu)) => {
                    ensure!(
                        accel + cpu == total,
                        "operation counts do not add up: {} on accelerator + {} on cpu != {} total",
                        accel,
                        cpu,
                        total
                    );
                    (total, accel, cpu)
                }
                (Some(total), Some(accel), None) => {
                    ensure!(accel <= total, "more accelerator operations than total");
                    (total, accel, total - accel)
                }
                (Some(total), None, Some(cpu)) => {
                    ensure!(cpu <= total, "more cpu operations than total");
                    (total, total - cpu, cpu)
                }
                // the compiler omits the split when every operation is mapped
                (Some(total), None, None) if success => (total, total, 0),
                (Some(total), None, None) => (total, 0, total),
                (None, _, _) if !success => (0, 0, 0),
                (None, _, _) => bail!("compiler reported success without an operation count"),
            };

        let compiler_version = VERSION_REGEX
            .captures(text)
            .map(|captures| captures[1].to_string());
        let subgraphs = capture_count(&SUBGRAPHS_REGEX, text)?;
        let output_model = OUTPUT_MODEL_REGEX
            .captures(text)
            .map(|captures| PathBuf::from(&captures[1]));
        let log_path = OPERATION_LOG_REGEX
            .captures(text)
            .map(|captures| PathBuf::from(&captures[1]));
        let operations = parse_operation_table(text)?;

        Ok(CompilationReport {
            compiler_version,
            success,
            total_ops,
            ops_on_accelerator,
            ops_on_fallback_cpu,
            subgraphs,
            output_model,
            log_path,
            operations,
        })
    }

    fn parse_operation_log(&self, text: &str) -> Result<Vec<OperationSummary>> {
        let operations = parse_operation_table(text)?;
        ensure!(
            !operations.is_empty(),
            "the operation log does not contain an operator table"
        );
        Ok(operations)
    }
}

fn capture_count(regex: &Regex, text: &str) -> Result<Option<usize>> {
    regex
        .captures(text)
        .map(|captures| {
            let value = &captures[1];
            value
                .parse::<usize>()
                .with_context(|| format!("invalid operation count '{}'", value))
        })
        .transpose()
}

/// Parses the `Operator  Count  Status` table, if present.
fn parse_operation_table(text: &str) -> Result<Vec<OperationSummary>> {
    let mut lines = text
        .lines()
        .skip_while(|line| !TABLE_HEADER_REGEX.is_match(line));

    // no table at all
    if lines.next().is_none() {
        return Ok(vec![]);
    }

    let mut operations = vec![];

    for line in lines {
        if line.trim().is_empty() {
            if operations.is_empty() {
                continue;
            } else {
                break;
            }
        }

        let captures = match TABLE_ROW_REGEX.captures(line) {
            Some(captures) => captures,
            None if operations.is_empty() => {
                bail!("malformed operator table row '{}'", line)
            }
            None => break,
        };

        let operator = captures[1].to_string();
        let count: usize = captures[2]
            .parse()
            .with_context(|| format!("invalid operator count in row '{}'", line))?;
        let status_text = captures[3].trim();
        let status = if status_text == MAPPED_STATUS {
            OperationStatus::Mapped
        } else {
            OperationStatus::Unmapped {
                reason: status_text.to_string(),
            }
        };

        operations.push(OperationSummary {
            operator,
            count,
            status,
        });
    }

    Ok(operations)
}
