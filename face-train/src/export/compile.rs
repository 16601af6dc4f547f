use crate::{common::*, config::CompilerConfig};
use compiler_report::{CompilationReport, ReportParser};
use std::process::Stdio;

/// Runs the accelerator compiler on a quantized model and parses its report.
///
/// A non-zero exit, unparsable output or timeout is an export error. A report
/// of failed or partial offload is returned as is.
pub async fn compile_model(
    config: &CompilerConfig,
    parser: &dyn ReportParser,
    quantized: &Path,
    output_dir: &Path,
) -> Fallible<CompilationReport> {
    let to_error = |message: String| Error::export(ExportStage::Compile, message);

    if !quantized.is_file() {
        return Err(to_error(format!(
            "quantized model '{}' does not exist",
            quantized.display()
        )));
    }

    let mut command = tokio::process::Command::new(&config.program);
    command
        .args(&config.args)
        .arg("-o")
        .arg(output_dir)
        .arg("-s")
        .arg(quantized)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    info!(
        "run compiler {} on '{}'",
        config.program.display(),
        quantized.display()
    );
    let child = command.spawn().map_err(|err| {
        to_error(format!(
            "failed to start compiler '{}': {}",
            config.program.display(),
            err
        ))
    })?;

    // the child is killed when the timed out future is dropped
    let timeout = Duration::from_secs(config.timeout_secs);
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|err| to_error(format!("compiler failed: {}", err)))?,
        Err(_) => {
            return Err(to_error(format!(
                "compiler timeout after {} seconds",
                config.timeout_secs
            )))
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        return Err(to_error(format!(
            "compiler exited with {}: {}",
            output.status,
            last_lines(&stderr, 5)
        )));
    }

    let text = format!("{}\n{}", stdout, stderr);
    let mut report = parser
        .parse_output(&text)
        .map_err(|err| to_error(format!("unparsable compiler output: {:#}", err)))?;

    report.output_model = report
        .output_model
        .map(|path| resolve_path(output_dir, path));
    report.log_path = report.log_path.map(|path| resolve_path(output_dir, path));

    if let Some(log_path) = &report.log_path {
        match tokio::fs::read_to_string(log_path).await {
            Ok(log) => match parser.parse_operation_log(&log) {
                Ok(operations) if !operations.is_empty() => report.operations = operations,
                Ok(_) => {}
                Err(err) => warn!(
                    "failed to parse operation log '{}': {:#}",
                    log_path.display(),
                    err
                ),
            },
            Err(err) => warn!(
                "failed to read operation log '{}': {}",
                log_path.display(),
                err
            ),
        }
    }

    info!("compilation {}", report);
    Ok(report)
}

/// Describes a compilation that does not run entirely on the accelerator.
pub fn check_offload(report: &CompilationReport) -> Option<String> {
    if report.is_fully_offloaded() {
        return None;
    }

    let unmapped = report
        .unmapped_operations()
        .map(|summary| summary.operator.as_str())
        .join(", ");
    let message = if !report.success {
        format!(
            "the compiler reported an unsuccessful compilation: {}",
            report
        )
    } else if unmapped.is_empty() {
        format!(
            "partial offload: {} of {} operations run on the CPU",
            report.ops_on_fallback_cpu, report.total_ops
        )
    } else {
        format!(
            "partial offload: {} of {} operations run on the CPU ({})",
            report.ops_on_fallback_cpu, report.total_ops, unmapped
        )
    };

    warn!("{}", message);
    Some(message)
}

fn resolve_path(output_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        output_dir.join(path)
    }
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<_> = text.trim().lines().collect();
    lines[lines.len().saturating_sub(count)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_lines_test() {
        assert_eq!(last_lines("a\nb\nc\n", 2), "b\nc");
        assert_eq!(last_lines("a", 5), "a");
        assert_eq!(last_lines("", 5), "");
    }
}
