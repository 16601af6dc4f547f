use super::LabeledRecord;
use crate::{common::*, config::DatasetKind};

/// The external collaborator that lists the labeled corpus.
pub trait DataSource
where
    Self: Debug + Send + Sync,
{
    /// Lists the corpus, sorted by path.
    fn load(&self) -> Fallible<Vec<LabeledRecord>>;
}

/// Builds the data source selected by the configuration.
pub fn data_source(kind: &DatasetKind) -> Box<dyn DataSource> {
    match kind {
        DatasetKind::Directory { dir, extensions } => Box::new(DirectorySource {
            dir: dir.clone(),
            extensions: extensions.clone(),
        }),
        DatasetKind::Csv {
            image_dir,
            label_file,
        } => Box::new(CsvSource {
            image_dir: image_dir.clone(),
            label_file: label_file.clone(),
        }),
    }
}

/// A directory with one sub-directory per class.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    pub dir: PathBuf,
    pub extensions: Vec<String>,
}

impl DataSource for DirectorySource {
    fn load(&self) -> Fallible<Vec<LabeledRecord>> {
        let Self { dir, extensions } = self;

        if !dir.is_dir() {
            return Err(Error::data(format!(
                "dataset directory '{}' does not exist",
                dir.display()
            )));
        }

        let extensions: HashSet<_> = extensions.iter().map(|ext| ext.to_lowercase()).collect();
        let pattern = format!("{}/*/*", dir.display());
        let paths = glob::glob(&pattern).map_err(Error::configuration)?;

        let mut records: Vec<_> = paths
            .map(|path| path.map_err(Error::data))
            .filter_map(|path| {
                let path = match path {
                    Ok(path) => path,
                    Err(err) => return Some(Err(err)),
                };
                let ext = path.extension()?.to_str()?.to_lowercase();
                if !path.is_file() || !extensions.contains(&ext) {
                    return None;
                }
                let label = path.parent()?.file_name()?.to_str()?.to_owned();
                Some(Ok(LabeledRecord { path, label }))
            })
            .try_collect()?;

        if records.is_empty() {
            return Err(Error::data(format!(
                "no images found in '{}'",
                dir.display()
            )));
        }

        records.sort();
        Ok(records)
    }
}

/// A CSV manifest with `image_file` and `label` columns.
#[derive(Debug, Clone)]
pub struct CsvSource {
    pub image_dir: PathBuf,
    pub label_file: PathBuf,
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    image_file: PathBuf,
    label: String,
}

impl DataSource for CsvSource {
    fn load(&self) -> Fallible<Vec<LabeledRecord>> {
        let Self {
            image_dir,
            label_file,
        } = self;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .from_path(label_file)
            .map_err(|err| {
                Error::data(format!(
                    "failed to open label file '{}': {}",
                    label_file.display(),
                    err
                ))
            })?;

        let mut records: Vec<_> = reader
            .deserialize()
            .enumerate()
            .map(|(line, row)| -> Fallible<_> {
                let CsvRow { image_file, label } = row.map_err(|err| {
                    Error::data(format!(
                        "invalid row {} in '{}': {}",
                        line + 1,
                        label_file.display(),
                        err
                    ))
                })?;
                let path = image_dir.join(image_file);
                if !path.is_file() {
                    return Err(Error::data(format!(
                        "image file '{}' does not exist",
                        path.display()
                    )));
                }
                Ok(LabeledRecord { path, label })
            })
            .try_collect()?;

        if records.is_empty() {
            return Err(Error::data(format!(
                "label file '{}' has no records",
                label_file.display()
            )));
        }

        records.sort();
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_source_test() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for (label, file) in [
            ("bob", "2.JPG"),
            ("alice", "1.jpg"),
            ("alice", "0.png"),
            ("alice", "notes.txt"),
        ] {
            let class_dir = dir.path().join(label);
            fs::create_dir_all(&class_dir)?;
            fs::write(class_dir.join(file), b"")?;
        }

        let source = DirectorySource {
            dir: dir.path().to_owned(),
            extensions: vec!["jpg".into(), "png".into()],
        };
        let records = source.load()?;
        let labels: Vec<_> = records.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, ["alice", "alice", "bob"]);
        assert!(records[0].path.ends_with("alice/0.png"));
        Ok(())
    }

    #[test]
    fn csv_source_test() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("a.jpg"), b"")?;
        fs::write(dir.path().join("b.jpg"), b"")?;
        let label_file = dir.path().join("labels.csv");
        fs::write(
            &label_file,
            "image_file,label\n# comment\nb.jpg,bob\na.jpg,alice\n",
        )?;

        let source = CsvSource {
            image_dir: dir.path().to_owned(),
            label_file: label_file.clone(),
        };
        let records = source.load()?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].label, "alice");

        fs::write(&label_file, "image_file,label\nmissing.jpg,bob\n")?;
        assert!(matches!(source.load(), Err(Error::Data(_))));
        Ok(())
    }
}
