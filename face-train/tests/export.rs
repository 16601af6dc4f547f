use anyhow::{format_err, Result};
use face_train::{
    config::{CompilerConfig, ExportConfig, QuantizerConfig},
    data::{ClassIndex, DatasetSplit, LabeledRecord, Partition, SplitEntry, SplitKind},
    evaluate::Predict,
    export::{
        ActivationRange, ExportPipeline, Exportable, NamedParameter, QuantizedModel,
        METADATA_FILE_NAME,
    },
    model::{Architecture, ModelSpec},
    Error, ExportStage,
};
use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};

const FULL_OFFLOAD: &str = r#"
echo "Edge TPU Compiler version 16.0.384591198"
echo "Model compiled successfully in 12 ms."
echo "Input model: tiny-face-quant.tflite"
echo "Output model: tiny-face-quant_edgetpu.tflite"
echo "Number of Edge TPU subgraphs: 1"
echo "Total number of operations: 5"
echo "Operation log: tiny-face-quant_edgetpu.log"
echo "Compilation succeeded! "
touch "$2/tiny-face-quant_edgetpu.tflite"
cat > "$2/tiny-face-quant_edgetpu.log" <<'LOG'
Edge TPU Compiler version 16.0.384591198

Operator                       Count      Status

CONV_2D                        3          Mapped to Edge TPU
FULLY_CONNECTED                2          Mapped to Edge TPU
LOG
"#;

const PARTIAL_OFFLOAD: &str = r#"
echo "Edge TPU Compiler version 16.0.384591198"
echo "Model compiled successfully in 12 ms."
echo "Output model: tiny-face-quant_edgetpu.tflite"
echo "Number of Edge TPU subgraphs: 1"
echo "Total number of operations: 5"
echo "Number of operations that will run on Edge TPU: 4"
echo "Number of operations that will run on CPU: 1"
echo ""
echo "Operator                       Count      Status"
echo ""
echo "CONV_2D                        3          Mapped to Edge TPU"
echo "FULLY_CONNECTED                1          Mapped to Edge TPU"
echo "SOFTMAX                        1          More than one subgraph is not supported"
echo "Compilation succeeded! "
"#;

const NONZERO_EXIT: &str = r#"
echo "Edge TPU Compiler version 16.0.384591198"
echo "Internal compiler error. Aborting!" >&2
exit 3
"#;

const GARBAGE: &str = r#"
echo "segmentation fault in converter"
"#;

const HANG: &str = r#"
sleep 10
"#;

#[derive(Debug)]
struct MockModel {
    spec: ModelSpec,
    /// Fails every prediction, as an unreadable test image does.
    broken_predictions: bool,
}

impl MockModel {
    fn new() -> Self {
        Self {
            spec: ModelSpec {
                architecture: Architecture::Tiny,
                image_size: 32,
                dense_units: 8,
                dropout: 0.2,
                l2_penalty: 0.01,
                freeze_layer_count: 0,
                num_classes: 2,
            },
            broken_predictions: false,
        }
    }
}

impl Predict for MockModel {
    fn predict(&self, batch: &[SplitEntry]) -> Result<Vec<usize>> {
        if self.broken_predictions {
            return Err(format_err!("unable to decode '{}'", batch[0].record.path.display()));
        }
        Ok(batch.iter().map(|entry| entry.class).collect())
    }
}

impl Exportable for MockModel {
    fn model_spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn write_weights(&self, path: &Path) -> Result<()> {
        fs::write(path, b"weights")?;
        Ok(())
    }

    fn named_parameters(&self) -> Result<Vec<NamedParameter>> {
        Ok(vec![
            NamedParameter {
                name: "head.output.bias".into(),
                shape: vec![2],
                values: vec![0.25, -0.5],
            },
            NamedParameter {
                name: "head.output.weight".into(),
                shape: vec![2, 2],
                values: vec![1.0, -1.0, 0.5, 0.0],
            },
        ])
    }

    fn activation_ranges(
        &self,
        calibration: &[SplitEntry],
        _batch_size: usize,
    ) -> Result<Vec<ActivationRange>> {
        assert!(!calibration.is_empty());
        Ok(vec![ActivationRange {
            name: "logits".into(),
            min: -3.0,
            max: 5.0,
        }])
    }
}

fn partition() -> Partition {
    let class_index = ClassIndex::from_labels(["alice", "bob"]).unwrap();
    let split = |kind: SplitKind, len: usize| {
        let entries = (0..len)
            .map(|index| SplitEntry {
                record: Arc::new(LabeledRecord {
                    path: format!("/data/{}/{:03}.jpg", kind, index).into(),
                    label: class_index.label(index % 2).unwrap().into(),
                }),
                class: index % 2,
            })
            .collect();
        DatasetSplit::new(kind, entries)
    };

    Partition {
        train: split(SplitKind::Train, 8),
        validation: split(SplitKind::Validation, 4),
        test: split(SplitKind::Test, 4),
        class_index: class_index.clone(),
    }
}

fn export_config(output_dir: &Path, compiler: Option<CompilerConfig>) -> ExportConfig {
    ExportConfig {
        enabled: true,
        output_dir: output_dir.to_owned(),
        task: "face".into(),
        version: None,
        calibration_samples: NonZeroUsize::new(5).unwrap(),
        quantizer: QuantizerConfig::Builtin {
            extension: "tflite".into(),
        },
        compiler,
    }
}

/// Writes a shell script standing in for the compiler.
fn fake_compiler(dir: &Path, script: &str, timeout_secs: u64) -> Result<CompilerConfig> {
    let path = dir.join("fake_compiler.sh");
    fs::write(&path, script)?;
    Ok(CompilerConfig {
        program: PathBuf::from("sh"),
        args: vec![path.display().to_string()],
        timeout_secs,
    })
}

fn retained_paths(err: &Error) -> &[PathBuf] {
    match err {
        Error::Export {
            stage: ExportStage::Compile,
            retained,
            ..
        } => retained,
        other => panic!("expect a compile stage export error, but get {:?}", other),
    }
}

#[tokio::test]
async fn full_offload_test() -> Result<()> {
    let work_dir = tempfile::tempdir()?;
    let output_dir = work_dir.path().join("models");
    let compiler = fake_compiler(work_dir.path(), FULL_OFFLOAD, 30)?;
    let pipeline = ExportPipeline::new(&export_config(&output_dir, Some(compiler)), 4, 1234);
    let partition = partition();

    let prepared = pipeline.prepare(&MockModel::new(), &partition.class_index, &partition)?;
    assert_eq!(prepared.serialized.dir, output_dir.join("tiny").join("1"));
    assert_eq!(prepared.quantized, output_dir.join("tiny-face-quant.tflite"));
    assert!(prepared.serialized.weights_file.is_file());
    assert!(prepared.serialized.dir.join(METADATA_FILE_NAME).is_file());

    let metadata = prepared.serialized.load_metadata()?;
    assert_eq!(metadata.class_dict["alice"], 0);
    assert_eq!(metadata.class_dict["bob"], 1);

    let quantized = QuantizedModel::open(&prepared.quantized)?;
    assert_eq!(quantized.header.calibration_samples, 5);
    assert_eq!(quantized.header.source_version, 1);
    let bias = quantized.dequantize("head.output.bias").unwrap();
    assert!((bias[0] - 0.25).abs() < 0.01);
    assert!((bias[1] + 0.5).abs() < 0.01);

    let outcome = pipeline.compile(prepared).await?;
    let report = outcome.compilation.unwrap();
    assert!(report.success);
    assert_eq!(report.total_ops, 5);
    assert_eq!(report.ops_on_accelerator, 5);
    assert_eq!(
        report.output_model,
        Some(output_dir.join("tiny-face-quant_edgetpu.tflite"))
    );
    // the operation table comes from the log file
    assert_eq!(report.operations.len(), 2);
    assert!(outcome.offload_warning.is_none());
    Ok(())
}

#[tokio::test]
async fn partial_offload_is_warning_test() -> Result<()> {
    let work_dir = tempfile::tempdir()?;
    let output_dir = work_dir.path().join("models");
    let compiler = fake_compiler(work_dir.path(), PARTIAL_OFFLOAD, 30)?;
    let pipeline = ExportPipeline::new(&export_config(&output_dir, Some(compiler)), 4, 1234);
    let partition = partition();

    let prepared = pipeline.prepare(&MockModel::new(), &partition.class_index, &partition)?;
    let outcome = pipeline.compile(prepared).await?;

    let report = outcome.compilation.unwrap();
    assert_eq!(report.ops_on_fallback_cpu, 1);
    let warning = outcome.offload_warning.unwrap();
    assert!(warning.contains("partial offload"));
    assert!(warning.contains("SOFTMAX"));
    Ok(())
}

#[tokio::test]
async fn compiler_failures_retain_artifacts_test() -> Result<()> {
    for (script, timeout_secs, expected) in [
        (NONZERO_EXIT, 30, "exited"),
        (GARBAGE, 30, "unparsable"),
        (HANG, 1, "timeout"),
    ] {
        let work_dir = tempfile::tempdir()?;
        let output_dir = work_dir.path().join("models");
        let compiler = fake_compiler(work_dir.path(), script, timeout_secs)?;
        let pipeline = ExportPipeline::new(&export_config(&output_dir, Some(compiler)), 4, 1234);
        let partition = partition();

        let prepared = pipeline.prepare(&MockModel::new(), &partition.class_index, &partition)?;
        let err = pipeline.compile(prepared.clone()).await.unwrap_err();

        assert!(err.to_string().contains(expected), "{}", err);
        let retained = retained_paths(&err);
        assert!(retained.contains(&prepared.serialized.dir));
        assert!(retained.contains(&prepared.quantized));
        assert!(prepared.serialized.weights_file.is_file());
        assert!(prepared.quantized.is_file());
    }
    Ok(())
}

#[tokio::test]
async fn compilation_is_skipped_without_compiler_test() -> Result<()> {
    let work_dir = tempfile::tempdir()?;
    let output_dir = work_dir.path().join("models");
    let pipeline = ExportPipeline::new(&export_config(&output_dir, None), 4, 1234);
    let partition = partition();

    let prepared = pipeline.prepare(&MockModel::new(), &partition.class_index, &partition)?;
    let outcome = pipeline.compile(prepared).await?;
    assert!(outcome.compilation.is_none());
    assert!(outcome.quantized.is_file());
    Ok(())
}

#[test]
fn versions_increase_test() -> Result<()> {
    let work_dir = tempfile::tempdir()?;
    let output_dir = work_dir.path().join("models");
    let pipeline = ExportPipeline::new(&export_config(&output_dir, None), 4, 1234);
    let partition = partition();
    let model = MockModel::new();

    let first = pipeline.prepare(&model, &partition.class_index, &partition)?;
    let second = pipeline.prepare(&model, &partition.class_index, &partition)?;
    assert_eq!(first.serialized.version, 1);
    assert_eq!(second.serialized.version, 2);
    assert!(first.serialized.weights_file.is_file());
    Ok(())
}

#[test]
fn quantizer_failure_retains_serialized_model_test() -> Result<()> {
    let work_dir = tempfile::tempdir()?;
    let output_dir = work_dir.path().join("models");
    let config = ExportConfig {
        quantizer: QuantizerConfig::External {
            program: PathBuf::from("false"),
            args: vec![],
            extension: "tflite".into(),
        },
        ..export_config(&output_dir, None)
    };
    let pipeline = ExportPipeline::new(&config, 4, 1234);
    let partition = partition();

    let err = pipeline
        .prepare(&MockModel::new(), &partition.class_index, &partition)
        .unwrap_err();
    match err {
        Error::Export {
            stage: ExportStage::Quantize,
            retained,
            ..
        } => {
            assert_eq!(retained, [output_dir.join("tiny").join("1")]);
            assert!(retained[0].join("model.ot").is_file());
        }
        other => panic!("unexpected error {:?}", other),
    }
    Ok(())
}

#[test]
fn evaluation_after_export_test() -> Result<()> {
    let work_dir = tempfile::tempdir()?;
    let output_dir = work_dir.path().join("models");
    let pipeline = ExportPipeline::new(&export_config(&output_dir, None), 4, 1234);
    let partition = partition();

    let (prepared, evaluation) =
        face_train::export_and_evaluate(&MockModel::new(), &partition, Some(&pipeline), true, 4)?;
    assert!(prepared.unwrap().quantized.is_file());
    let evaluation = evaluation.unwrap();
    assert_eq!(evaluation.total, 4);
    assert_eq!(evaluation.accuracy, 1.0);
    Ok(())
}

#[test]
fn failed_evaluation_keeps_exported_model_test() -> Result<()> {
    let work_dir = tempfile::tempdir()?;
    let output_dir = work_dir.path().join("models");
    let pipeline = ExportPipeline::new(&export_config(&output_dir, None), 4, 1234);
    let partition = partition();
    let model = MockModel {
        broken_predictions: true,
        ..MockModel::new()
    };

    let err = face_train::export_and_evaluate(&model, &partition, Some(&pipeline), true, 4)
        .unwrap_err();
    assert!(matches!(err, Error::Data(_)), "{}", err);
    assert!(err.to_string().contains("unable to decode"));

    let model_dir = output_dir.join("tiny").join("1");
    assert!(model_dir.join("model.ot").is_file());
    assert!(model_dir.join(METADATA_FILE_NAME).is_file());
    assert!(output_dir.join("tiny-face-quant.tflite").is_file());
    Ok(())
}
