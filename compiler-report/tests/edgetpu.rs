use anyhow::Result;
use compiler_report::{EdgeTpuParser, OperationStatus, ReportParser};
use std::path::{Path, PathBuf};

fn load(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name);
    std::fs::read_to_string(&path)
        .unwrap_or_else(|err| panic!("failed to read {}: {:?}", path.display(), err))
}

#[test]
fn full_offload_test() -> Result<()> {
    let report = EdgeTpuParser::new().parse_output(&load("full_offload.txt"))?;

    assert!(report.success);
    assert_eq!(report.compiler_version.as_deref(), Some("16.0.384591198"));
    assert_eq!(report.total_ops, 77);
    assert_eq!(report.ops_on_accelerator, 77);
    assert_eq!(report.ops_on_fallback_cpu, 0);
    assert_eq!(report.subgraphs, Some(1));
    assert_eq!(
        report.log_path,
        Some(PathBuf::from("resnet50-face-quant_edgetpu.log"))
    );
    assert!(report.is_fully_offloaded());
    assert!(report.operations.is_empty());
    Ok(())
}

#[test]
fn partial_offload_test() -> Result<()> {
    let report = EdgeTpuParser::new().parse_output(&load("partial_offload.txt"))?;

    assert!(report.success);
    assert_eq!(report.total_ops, 72);
    assert_eq!(report.ops_on_accelerator, 70);
    assert_eq!(report.ops_on_fallback_cpu, 2);
    assert!(!report.is_fully_offloaded());
    assert_eq!(report.operations.len(), 9);

    let unmapped: Vec<_> = report
        .unmapped_operations()
        .map(|op| op.operator.as_str())
        .collect();
    assert_eq!(unmapped, ["DEQUANTIZE", "SOFTMAX"]);

    let table_total: usize = report.operations.iter().map(|op| op.count).sum();
    assert_eq!(table_total, report.total_ops);
    Ok(())
}

#[test]
fn failure_test() -> Result<()> {
    let report = EdgeTpuParser::new().parse_output(&load("failure.txt"))?;

    assert!(!report.success);
    assert_eq!(report.total_ops, 0);
    assert!(!report.is_fully_offloaded());
    Ok(())
}

#[test]
fn unrecognized_output_test() {
    let result = EdgeTpuParser::new().parse_output(&load("garbage.txt"));
    assert!(result.is_err());
}

#[test]
fn merge_operation_log_test() -> Result<()> {
    let parser = EdgeTpuParser::new();
    let output = load("full_offload.txt");
    let log = load("operation_log.txt");
    let report = parser.parse_with_log(&output, Some(&log))?;

    assert_eq!(report.operations.len(), 8);
    assert!(report
        .operations
        .iter()
        .all(|op| op.status == OperationStatus::Mapped));
    Ok(())
}
