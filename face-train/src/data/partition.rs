use super::{ClassIndex, DatasetSplit, LabeledRecord, SplitEntry, SplitKind};
use crate::{common::*, config::ClassOrder, utils::Ratio};

/// Partitioner options.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    pub validation_fraction: Ratio,
    pub test_fraction: Ratio,
    /// Hold out a test split.
    pub test_enabled: bool,
    pub class_order: ClassOrder,
    pub unknown_class: Option<String>,
    pub seed: u64,
}

/// The class index and the three disjoint splits of a corpus.
#[derive(Debug, Clone)]
pub struct Partition {
    pub class_index: ClassIndex,
    pub train: DatasetSplit,
    pub validation: DatasetSplit,
    /// Empty if evaluation is disabled.
    pub test: DatasetSplit,
}

impl Partition {
    pub fn num_classes(&self) -> usize {
        self.class_index.len()
    }

    pub fn splits(&self) -> [&DatasetSplit; 3] {
        [&self.train, &self.validation, &self.test]
    }

    /// Train and validation entries, the pool of calibration examples.
    pub fn train_and_validation(&self) -> impl Iterator<Item = &SplitEntry> {
        self.train.iter().chain(self.validation.iter())
    }
}

/// Splits the corpus per class with a seeded shuffle.
///
/// Records must be sorted by path for the result to be reproducible.
pub fn partition(records: Vec<LabeledRecord>, config: &PartitionConfig) -> Fallible<Partition> {
    let PartitionConfig {
        validation_fraction,
        test_fraction,
        test_enabled,
        class_order,
        ref unknown_class,
        seed,
    } = *config;

    if records.is_empty() {
        return Err(Error::data("the corpus is empty"));
    }

    let test_fraction = if test_enabled {
        test_fraction
    } else {
        Ratio::zero()
    };
    let held_out = validation_fraction
        .checked_add(test_fraction)
        .map_err(Error::configuration)?;
    if held_out.to_f64() >= 1.0 - f64::default_epsilon() {
        return Err(Error::configuration(format!(
            "validation and test fractions sum to {}, leaving no training data",
            held_out
        )));
    }

    let class_index = ClassIndex::build(&records, class_order, unknown_class.as_deref())?;

    // group records by class index, keeping path order within each class
    let mut groups: Vec<Vec<SplitEntry>> = vec![vec![]; class_index.len()];
    for record in records {
        let class = class_index
            .index_of(&record.label)
            .ok_or_else(|| Error::data(format!("unindexed label '{}'", record.label)))?;
        groups[class].push(SplitEntry {
            record: Arc::new(record),
            class,
        });
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = vec![];
    let mut validation = vec![];
    let mut test = vec![];

    for (class, mut entries) in groups.into_iter().enumerate() {
        entries.shuffle(&mut rng);
        let num_entries = entries.len();
        let num_test = test_fraction.of_count(num_entries);
        let num_validation = validation_fraction.of_count(num_entries);
        let num_held_out = (num_test + num_validation).min(num_entries);

        if num_held_out == num_entries {
            return Err(Error::data(format!(
                "class '{}' has {} examples, leaving none for the train split",
                class_index.label(class).unwrap_or("?"),
                num_entries
            )));
        }

        let mut iter = entries.into_iter();
        test.extend(iter.by_ref().take(num_test));
        validation.extend(iter.by_ref().take(num_held_out - num_test));
        train.extend(iter);
    }

    let partition = Partition {
        class_index,
        train: DatasetSplit::new(SplitKind::Train, train),
        validation: DatasetSplit::new(SplitKind::Validation, validation),
        test: DatasetSplit::new(SplitKind::Test, test),
    };

    for split in partition.splits() {
        let expected = split.kind != SplitKind::Test || test_enabled;
        if expected && split.is_empty() {
            return Err(Error::data(format!("the {} split is empty", split.kind)));
        }
    }

    info!(
        "dataset split: train={} validation={} test={}",
        partition.train.len(),
        partition.validation.len(),
        partition.test.len()
    );
    info!("class_dict: {}", partition.class_index);

    Ok(partition)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus(counts: &[(&str, usize)]) -> Vec<LabeledRecord> {
        counts
            .iter()
            .flat_map(|&(label, count)| {
                (0..count).map(move |idx| LabeledRecord {
                    path: PathBuf::from(format!("{}/{:04}.jpg", label, idx)),
                    label: label.to_string(),
                })
            })
            .sorted()
            .collect()
    }

    fn config(seed: u64) -> PartitionConfig {
        PartitionConfig {
            validation_fraction: Ratio::try_from(0.2).unwrap(),
            test_fraction: Ratio::try_from(0.1).unwrap(),
            test_enabled: true,
            class_order: ClassOrder::Alphabetical,
            unknown_class: Some("unknown".into()),
            seed,
        }
    }

    #[test]
    fn disjoint_cover_test() -> Result<()> {
        let records = corpus(&[("alice", 37), ("bob", 12), ("unknown", 101)]);
        let partition = partition(records.clone(), &config(7))?;

        let mut seen = HashSet::new();
        for split in partition.splits() {
            for entry in split.iter() {
                assert!(seen.insert(entry.record.path.clone()), "duplicated record");
                assert_eq!(
                    partition.class_index.label(entry.class),
                    Some(entry.record.label.as_str())
                );
            }
        }
        let expect: HashSet<_> = records.into_iter().map(|r| r.path).collect();
        assert_eq!(seen, expect);
        Ok(())
    }

    #[test]
    fn stratified_sizes_test() -> Result<()> {
        let records = corpus(&[("alice", 10), ("unknown", 20)]);
        let partition = partition(records, &config(1))?;

        assert_eq!(partition.class_index.index_of("unknown"), Some(0));
        assert_eq!(partition.test.class_counts(2), [2, 1]);
        assert_eq!(partition.validation.class_counts(2), [4, 2]);
        assert_eq!(partition.train.class_counts(2), [14, 7]);
        Ok(())
    }

    #[test]
    fn deterministic_partition_test() -> Result<()> {
        let records = corpus(&[("alice", 30), ("bob", 30)]);
        let lhs = partition(records.clone(), &config(42))?;
        let rhs = partition(records.clone(), &config(42))?;
        let paths = |split: &DatasetSplit| split.iter().map(|e| e.record.path.clone()).collect_vec();
        assert_eq!(paths(&lhs.train), paths(&rhs.train));
        assert_eq!(paths(&lhs.validation), paths(&rhs.validation));
        assert_eq!(paths(&lhs.test), paths(&rhs.test));

        let other = partition(records, &config(43))?;
        assert_ne!(paths(&lhs.train), paths(&other.train));
        Ok(())
    }

    #[test]
    fn test_split_disabled_test() -> Result<()> {
        let records = corpus(&[("alice", 10), ("bob", 10)]);
        let config = PartitionConfig {
            test_enabled: false,
            ..config(0)
        };
        let partition = partition(records, &config)?;
        assert!(partition.test.is_empty());
        assert_eq!(partition.train.len() + partition.validation.len(), 20);
        Ok(())
    }

    #[test]
    fn class_without_train_examples_test() {
        let records = corpus(&[("alice", 20), ("bob", 2)]);
        let config = PartitionConfig {
            validation_fraction: Ratio::try_from(0.25).unwrap(),
            test_fraction: Ratio::try_from(0.25).unwrap(),
            unknown_class: None,
            ..config(0)
        };
        let err = partition(records, &config).unwrap_err();
        assert!(matches!(err, Error::Data(_)));
        assert!(err.to_string().contains("'bob'"));
    }

    #[test]
    fn partition_errors_test() {
        let single = corpus(&[("alice", 10)]);
        assert!(matches!(
            partition(single, &config(0)),
            Err(Error::Configuration(_))
        ));

        // two examples per class leave nothing for the validation split
        let tiny = corpus(&[("alice", 2), ("bob", 2)]);
        let config = PartitionConfig {
            test_enabled: false,
            ..config(0)
        };
        assert!(matches!(partition(tiny, &config), Err(Error::Data(_))));

        assert!(matches!(partition(vec![], &config), Err(Error::Data(_))));

        let records = corpus(&[("alice", 10), ("bob", 10)]);
        let config = PartitionConfig {
            validation_fraction: Ratio::try_from(0.6).unwrap(),
            test_fraction: Ratio::try_from(0.4).unwrap(),
            ..config
        };
        let config = PartitionConfig {
            test_enabled: true,
            ..config
        };
        assert!(matches!(
            partition(records, &config),
            Err(Error::Configuration(_))
        ));
    }
}
