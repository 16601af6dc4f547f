use super::Exportable;
use crate::{common::*, data::ClassIndex, model::ModelSpec};

pub const WEIGHTS_FILE_NAME: &str = "model.ot";
pub const METADATA_FILE_NAME: &str = "model.json";

/// The metadata written next to the serialized weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub version: u32,
    pub model: ModelSpec,
    pub class_dict: IndexMap<String, usize>,
    pub created: String,
}

/// A serialized model at `<output_dir>/<architecture>/<version>/`.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedModel {
    pub dir: PathBuf,
    pub version: u32,
    pub weights_file: PathBuf,
    pub metadata_file: PathBuf,
}

impl SerializedModel {
    pub fn load_metadata(&self) -> Result<ModelMetadata> {
        let text = fs::read_to_string(&self.metadata_file)?;
        let metadata = serde_json::from_str(&text)?;
        Ok(metadata)
    }
}

/// Writes the weights and metadata to a versioned directory.
///
/// Without a fixed version, the next unused integer version is taken.
pub fn serialize_model<M>(
    model: &M,
    class_index: &ClassIndex,
    output_dir: &Path,
    version: Option<u32>,
) -> Fallible<SerializedModel>
where
    M: Exportable + ?Sized,
{
    let spec = model.model_spec();
    let arch_dir = output_dir.join(spec.architecture.as_ref());
    let to_error = |err: anyhow::Error| Error::export(ExportStage::Serialize, err);

    let version = match version {
        Some(version) => version,
        None => next_version(&arch_dir).map_err(to_error)?,
    };
    let dir = arch_dir.join(version.to_string());
    if dir.exists() {
        warn!("overwrite existing model version '{}'", dir.display());
    }

    let weights_file = dir.join(WEIGHTS_FILE_NAME);
    let metadata_file = dir.join(METADATA_FILE_NAME);

    (|| -> Result<()> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create directory '{}'", dir.display()))?;
        model.write_weights(&weights_file)?;

        let metadata = ModelMetadata {
            version,
            model: spec.clone(),
            class_dict: class_index.class_dict(),
            created: Local::now().to_rfc3339(),
        };
        let text = serde_json::to_string_pretty(&metadata)?;
        fs::write(&metadata_file, text)
            .with_context(|| format!("failed to write '{}'", metadata_file.display()))?;
        Ok(())
    })()
    .map_err(to_error)?;

    Ok(SerializedModel {
        dir,
        version,
        weights_file,
        metadata_file,
    })
}

/// One past the largest integer directory name, starting from 1.
fn next_version(arch_dir: &Path) -> Result<u32> {
    if !arch_dir.exists() {
        return Ok(1);
    }

    let max_version = fs::read_dir(arch_dir)?
        .map(|entry| -> Result<_> {
            let entry = entry?;
            let version = entry.file_type()?.is_dir().then(|| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.parse::<u32>().ok())
            });
            Ok(version.flatten())
        })
        .filter_map(|version| version.transpose())
        .try_fold(0, |max, version| -> Result<_> { Ok(max.max(version?)) })?;

    Ok(max_version + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_version_test() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let arch_dir = dir.path().join("tiny");
        assert_eq!(next_version(&arch_dir)?, 1);

        fs::create_dir_all(arch_dir.join("1"))?;
        fs::create_dir_all(arch_dir.join("7"))?;
        fs::create_dir_all(arch_dir.join("latest"))?;
        fs::write(arch_dir.join("9"), b"")?;
        assert_eq!(next_version(&arch_dir)?, 8);
        Ok(())
    }
}
