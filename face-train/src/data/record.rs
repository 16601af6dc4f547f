use crate::common::*;

/// An image reference with its label, without image pixels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabeledRecord {
    pub path: PathBuf,
    pub label: String,
}

/// A record with its dense class index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SplitEntry {
    pub record: Arc<LabeledRecord>,
    pub class: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum SplitKind {
    Train,
    Validation,
    Test,
}

/// An ordered collection of split entries.
#[derive(Debug, Clone)]
pub struct DatasetSplit {
    pub kind: SplitKind,
    pub entries: Vec<SplitEntry>,
}

impl DatasetSplit {
    pub fn new(kind: SplitKind, entries: Vec<SplitEntry>) -> Self {
        Self { kind, entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SplitEntry> {
        self.entries.iter()
    }

    /// Counts the examples of each of the `num_classes` classes.
    pub fn class_counts(&self, num_classes: usize) -> Vec<usize> {
        let mut counts = vec![0; num_classes];
        self.entries.iter().for_each(|entry| {
            counts[entry.class] += 1;
        });
        counts
    }
}
