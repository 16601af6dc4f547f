use super::{Exportable, SerializedModel};
use crate::{
    common::*,
    config::QuantizerConfig,
    data::{ClassIndex, SplitEntry},
    model::ModelSpec,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub const QUANTIZED_MAGIC: &[u8; 4] = b"FQNT";
pub const QUANTIZED_FORMAT_VERSION: u32 = 1;

/// A model parameter with values in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedParameter {
    pub name: String,
    pub shape: Vec<i64>,
    pub values: Vec<f32>,
}

/// The observed value range of an activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationRange {
    pub name: String,
    pub min: f32,
    pub max: f32,
}

impl ActivationRange {
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
        }
    }

    pub fn update(&mut self, min: f32, max: f32) {
        self.min = self.min.min(min);
        self.max = self.max.max(max);
    }
}

/// Inputs of the quantize stage besides the model.
#[derive(Debug, Clone, Copy)]
pub struct QuantizeInput<'a> {
    pub serialized: &'a SerializedModel,
    pub class_index: &'a ClassIndex,
    pub calibration: &'a [SplitEntry],
    pub batch_size: usize,
}

/// Converts a serialized model into a reduced-precision artifact.
pub trait Quantizer
where
    Self: Debug + Send + Sync,
{
    fn extension(&self) -> &str;

    fn quantize(&self, model: &dyn Exportable, input: &QuantizeInput<'_>, output: &Path)
        -> Result<()>;
}

/// Builds the quantizer selected by the configuration.
pub fn quantizer(config: &QuantizerConfig) -> Box<dyn Quantizer> {
    match config {
        QuantizerConfig::Builtin { extension } => Box::new(BuiltinQuantizer {
            extension: extension.clone(),
        }),
        QuantizerConfig::External {
            program,
            args,
            extension,
        } => Box::new(ExternalQuantizer {
            program: program.clone(),
            args: args.clone(),
            extension: extension.clone(),
        }),
    }
}

/// Int8 quantization parameters, `real = scale * (q - zero_point)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantParams {
    /// Symmetric parameters covering `[-max_abs, max_abs]` with `[-127, 127]`.
    pub fn symmetric(values: &[f32]) -> Self {
        let max_abs = values.iter().fold(0f32, |max, value| max.max(value.abs()));
        let scale = if max_abs > 0.0 { max_abs / 127.0 } else { 1.0 };
        Self {
            scale,
            zero_point: 0,
        }
    }

    /// Asymmetric parameters covering `[min, max]` extended to include zero.
    pub fn asymmetric(min: f32, max: f32) -> Self {
        let min = min.min(0.0);
        let max = max.max(0.0);
        let scale = if max > min { (max - min) / 255.0 } else { 1.0 };
        let zero_point = (-128.0 - min / scale).round().clamp(-128.0, 127.0) as i32;
        Self { scale, zero_point }
    }

    pub fn quantize(&self, value: f32) -> i8 {
        let q = (value / self.scale).round() + self.zero_point as f32;
        q.clamp(-128.0, 127.0) as i8
    }

    pub fn dequantize(&self, value: i8) -> f32 {
        self.scale * (value as i32 - self.zero_point) as f32
    }
}

/// A quantized tensor entry in the container header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedTensorInfo {
    pub name: String,
    pub shape: Vec<i64>,
    pub params: QuantParams,
    /// Byte offset in the payload section.
    pub offset: u64,
    pub len: u64,
}

/// A quantized activation entry in the container header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedActivationInfo {
    pub range: ActivationRange,
    pub params: QuantParams,
}

/// The JSON header of the quantized container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedHeader {
    /// The serialized model directory this artifact was produced from.
    pub source_model: PathBuf,
    pub source_version: u32,
    pub model: ModelSpec,
    pub class_dict: IndexMap<String, usize>,
    pub calibration_samples: usize,
    pub tensors: Vec<QuantizedTensorInfo>,
    pub activations: Vec<QuantizedActivationInfo>,
}

/// A quantized container read back from disk.
#[derive(Debug, Clone)]
pub struct QuantizedModel {
    pub header: QuantizedHeader,
    pub payload: Vec<u8>,
}

impl QuantizedModel {
    /// Reads a container written by [BuiltinQuantizer].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = io::BufReader::new(
            fs::File::open(path)
                .with_context(|| format!("failed to open '{}'", path.display()))?,
        );

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        ensure!(&magic == QUANTIZED_MAGIC, "'{}' is not a quantized model", path.display());
        let format_version = reader.read_u32::<LittleEndian>()?;
        ensure!(
            format_version == QUANTIZED_FORMAT_VERSION,
            "unsupported quantized format version {}",
            format_version
        );

        let header_len = reader.read_u32::<LittleEndian>()? as usize;
        let mut header = vec![0u8; header_len];
        reader.read_exact(&mut header)?;
        let header: QuantizedHeader = serde_json::from_slice(&header)?;

        let mut payload = vec![];
        reader.read_to_end(&mut payload)?;

        Ok(Self { header, payload })
    }

    /// Dequantizes a tensor by name.
    pub fn dequantize(&self, name: &str) -> Option<Vec<f32>> {
        let info = self.header.tensors.iter().find(|info| info.name == name)?;
        let start = info.offset as usize;
        let end = start + info.len as usize;
        let values = self
            .payload
            .get(start..end)?
            .iter()
            .map(|&byte| info.params.dequantize(byte as i8))
            .collect();
        Some(values)
    }
}

/// The built-in int8 quantizer.
///
/// Weights are quantized per tensor with symmetric ranges. Activations get
/// asymmetric ranges measured on the calibration subset.
#[derive(Debug, Clone)]
pub struct BuiltinQuantizer {
    pub extension: String,
}

impl Quantizer for BuiltinQuantizer {
    fn extension(&self) -> &str {
        &self.extension
    }

    fn quantize(
        &self,
        model: &dyn Exportable,
        input: &QuantizeInput<'_>,
        output: &Path,
    ) -> Result<()> {
        let QuantizeInput {
            serialized,
            class_index,
            calibration,
            batch_size,
        } = *input;
        ensure!(!calibration.is_empty(), "the calibration subset is empty");

        let activations: Vec<_> = model
            .activation_ranges(calibration, batch_size)?
            .into_iter()
            .map(|range| {
                let params = QuantParams::asymmetric(range.min, range.max);
                QuantizedActivationInfo { range, params }
            })
            .collect();

        let mut payload = vec![];
        let mut tensors = vec![];
        for param in model.named_parameters()? {
            let NamedParameter {
                name,
                shape,
                values,
            } = param;
            let params = QuantParams::symmetric(&values);
            let offset = payload.len() as u64;
            payload.extend(values.iter().map(|&value| params.quantize(value) as u8));
            tensors.push(QuantizedTensorInfo {
                name,
                shape,
                params,
                offset,
                len: values.len() as u64,
            });
        }

        let header = QuantizedHeader {
            source_model: serialized.dir.clone(),
            source_version: serialized.version,
            model: model.model_spec().clone(),
            class_dict: class_index.class_dict(),
            calibration_samples: calibration.len(),
            tensors,
            activations,
        };
        let header = serde_json::to_vec(&header)?;

        if let Some(dir) = output.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut writer = BufWriter::new(
            fs::File::create(output)
                .with_context(|| format!("failed to create '{}'", output.display()))?,
        );
        writer.write_all(QUANTIZED_MAGIC)?;
        writer.write_u32::<LittleEndian>(QUANTIZED_FORMAT_VERSION)?;
        writer.write_u32::<LittleEndian>(header.len() as u32)?;
        writer.write_all(&header)?;
        writer.write_all(&payload)?;
        writer.flush()?;

        Ok(())
    }
}

/// Runs an external converter command.
///
/// `{model_dir}`, `{calibration}` and `{output}` in the arguments are replaced
/// by the serialized model directory, a file listing the calibration images one
/// per line, and the output path.
#[derive(Debug, Clone)]
pub struct ExternalQuantizer {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub extension: String,
}

impl Quantizer for ExternalQuantizer {
    fn extension(&self) -> &str {
        &self.extension
    }

    fn quantize(
        &self,
        _model: &dyn Exportable,
        input: &QuantizeInput<'_>,
        output: &Path,
    ) -> Result<()> {
        let QuantizeInput {
            serialized,
            calibration,
            ..
        } = *input;
        ensure!(!calibration.is_empty(), "the calibration subset is empty");

        let calibration_file = serialized.dir.join("calibration.txt");
        {
            let mut writer = BufWriter::new(fs::File::create(&calibration_file)?);
            for entry in calibration {
                writeln!(writer, "{}", entry.record.path.display())?;
            }
            writer.flush()?;
        }

        let args: Vec<_> = self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{model_dir}", &serialized.dir.display().to_string())
                    .replace("{calibration}", &calibration_file.display().to_string())
                    .replace("{output}", &output.display().to_string())
            })
            .collect();

        info!("run quantizer {} {}", self.program.display(), args.join(" "));
        let result = std::process::Command::new(&self.program)
            .args(&args)
            .output()
            .with_context(|| format!("failed to run quantizer '{}'", self.program.display()))?;

        if !result.status.success() {
            bail!(
                "quantizer exited with {}: {}",
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            );
        }
        ensure!(
            output.is_file(),
            "quantizer did not produce '{}'",
            output.display()
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_error_within_half_step_test() {
        let values = [-1.5f32, -0.3, 0.0, 0.01, 0.77, 1.2];
        let params = QuantParams::symmetric(&values);
        assert_eq!(params.zero_point, 0);
        for &value in &values {
            let restored = params.dequantize(params.quantize(value));
            assert!((restored - value).abs() <= params.scale / 2.0 + 1e-6);
        }
        assert_eq!(params.quantize(-1.5), -127);
    }

    #[test]
    fn asymmetric_covers_range_test() {
        let params = QuantParams::asymmetric(0.0, 6.0);
        assert_eq!(params.quantize(0.0), -128);
        assert_eq!(params.quantize(6.0), 127);
        assert!((params.dequantize(params.quantize(2.9)) - 2.9).abs() <= params.scale / 2.0 + 1e-6);
    }

    #[test]
    fn zero_tensor_test() {
        let params = QuantParams::symmetric(&[0.0, 0.0]);
        assert_eq!(params.scale, 1.0);
        assert_eq!(params.quantize(0.0), 0);
    }
}
