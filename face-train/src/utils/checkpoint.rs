use crate::{common::*, config::LoadCheckpoint};

pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

static CHECKPOINT_FILENAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}\.\d{3}[+-]\d{4})_pass(\d{2,})_\d+\.\d+\.ckpt$")
        .unwrap()
});

/// A checkpoint file written at a pass boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointFile {
    pub path: PathBuf,
    /// The number of the pass whose completion the checkpoint records.
    pub pass: usize,
    pub datetime: DateTime<chrono::FixedOffset>,
}

impl CheckpointFile {
    /// Parses a checkpoint path of the form `<timestamp>_pass<NN>_<loss>.ckpt`.
    pub fn parse(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        let file_name = path.file_name()?.to_str()?;
        let captures = CHECKPOINT_FILENAME_REGEX.captures(file_name)?;
        let datetime = DateTime::parse_from_str(captures.get(1)?.as_str(), FILE_STRFTIME).ok()?;
        let pass = captures.get(2)?.as_str().parse().ok()?;
        Some(Self {
            path: path.to_owned(),
            pass,
            datetime,
        })
    }
}

/// The path of the checkpoint taken after `pass` completed.
pub fn checkpoint_path(checkpoint_dir: &Path, pass: usize, loss: f64) -> PathBuf {
    let filename = format!(
        "{}_pass{:02}_{:08.5}.ckpt",
        Local::now().format(FILE_STRFTIME),
        pass,
        loss
    );
    checkpoint_dir.join(filename)
}

/// Locate a checkpoint file with specified checkpoint loading method.
///
/// The recent method searches the checkpoint directories of all runs under `logging_dir`.
pub fn find_checkpoint(
    logging_dir: &Path,
    load_checkpoint: &LoadCheckpoint,
) -> Fallible<Option<CheckpointFile>> {
    let checkpoint = match load_checkpoint {
        LoadCheckpoint::Disabled => {
            info!("checkpoint loading is disabled");
            None
        }
        LoadCheckpoint::FromRecent => {
            let pattern = format!("{}/*/checkpoints/*.ckpt", logging_dir.display());
            let paths: Vec<_> = glob::glob(&pattern)
                .map_err(Error::configuration)?
                .filter_map(|path| path.ok())
                .collect();
            let checkpoint = paths
                .into_iter()
                .filter_map(CheckpointFile::parse)
                .max_by_key(|checkpoint| checkpoint.datetime);

            if checkpoint.is_none() {
                warn!("no checkpoint file found");
            }

            checkpoint
        }
        LoadCheckpoint::FromFile {
            file,
            completed_passes,
        } => {
            if !file.is_file() {
                return Err(Error::configuration(format!(
                    "checkpoint file '{}' does not exist",
                    file.display()
                )));
            }

            let pass = match (completed_passes, CheckpointFile::parse(file)) {
                (Some(pass), _) => *pass,
                (None, Some(parsed)) => parsed.pass,
                (None, None) => {
                    return Err(Error::configuration(format!(
                        "cannot infer the completed pass from '{}', set 'completed_passes'",
                        file.display()
                    )))
                }
            };

            let now = Local::now();
            Some(CheckpointFile {
                path: file.to_owned(),
                pass,
                datetime: now.with_timezone(now.offset()),
            })
        }
    };

    Ok(checkpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_name_round_trip_test() {
        let dir = Path::new("/tmp/run/checkpoints");
        let path = checkpoint_path(dir, 2, 0.12345);
        let parsed = CheckpointFile::parse(&path).unwrap();
        assert_eq!(parsed.pass, 2);
        assert_eq!(parsed.path, path);
    }

    #[test]
    fn reject_foreign_file_name_test() {
        assert!(CheckpointFile::parse("model.ot").is_none());
        assert!(CheckpointFile::parse("2022-01-01-00-00-00.000+0000_step01_1.0.ckpt").is_none());
    }

    #[test]
    fn find_recent_checkpoint_test() -> Result<()> {
        let logging_dir = tempfile::tempdir()?;
        let older = logging_dir.path().join("run-a").join("checkpoints");
        let newer = logging_dir.path().join("run-b").join("checkpoints");
        fs::create_dir_all(&older)?;
        fs::create_dir_all(&newer)?;
        fs::write(older.join("2022-01-01-00-00-00.000+0000_pass01_00.50000.ckpt"), b"")?;
        fs::write(newer.join("2022-01-02-00-00-00.000+0000_pass02_00.40000.ckpt"), b"")?;

        let found = find_checkpoint(logging_dir.path(), &LoadCheckpoint::FromRecent)?.unwrap();
        assert_eq!(found.pass, 2);
        assert!(found.path.starts_with(&newer));

        let none = find_checkpoint(logging_dir.path(), &LoadCheckpoint::Disabled)?;
        assert!(none.is_none());
        Ok(())
    }

    #[test]
    fn checkpoint_from_file_test() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("weights.ot");
        fs::write(&file, b"")?;

        let load = LoadCheckpoint::FromFile {
            file: file.clone(),
            completed_passes: None,
        };
        assert!(matches!(
            find_checkpoint(dir.path(), &load),
            Err(Error::Configuration(_))
        ));

        let load = LoadCheckpoint::FromFile {
            file,
            completed_passes: Some(1),
        };
        assert_eq!(find_checkpoint(dir.path(), &load)?.unwrap().pass, 1);
        Ok(())
    }
}
