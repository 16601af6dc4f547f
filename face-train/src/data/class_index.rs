use super::LabeledRecord;
use crate::{common::*, config::ClassOrder};

/// Bidirectional mapping between label names and dense class indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassIndex {
    classes: IndexSet<String>,
}

impl ClassIndex {
    /// Builds the index from a corpus sorted by path.
    ///
    /// The `unknown_class` label, if present in the corpus, takes index 0.
    pub fn build(
        records: &[LabeledRecord],
        order: ClassOrder,
        unknown_class: Option<&str>,
    ) -> Fallible<Self> {
        let mut labels: Vec<&str> = records
            .iter()
            .map(|record| record.label.as_str())
            .unique()
            .collect();

        if order == ClassOrder::Alphabetical {
            labels.sort_unstable();
        }

        if let Some(unknown) = unknown_class {
            if let Some(pos) = labels.iter().position(|label| *label == unknown) {
                let label = labels.remove(pos);
                labels.insert(0, label);
            }
        }

        if labels.len() < 2 {
            return Err(Error::configuration(format!(
                "at least 2 classes are required, but the corpus has {}",
                labels.len()
            )));
        }

        let classes = labels.into_iter().map(|label| label.to_owned()).collect();
        Ok(Self { classes })
    }

    pub fn from_labels<I, S>(labels: I) -> Fallible<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut classes = IndexSet::new();
        for label in labels {
            let label = label.into();
            if !classes.insert(label.clone()) {
                return Err(Error::configuration(format!(
                    "duplicated class name '{}'",
                    label
                )));
            }
        }
        Ok(Self { classes })
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.classes.get_index_of(label)
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.classes.get_index(index).map(|label| label.as_str())
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(|label| label.as_str())
    }

    /// The `{label: index}` dictionary.
    pub fn class_dict(&self) -> IndexMap<String, usize> {
        self.classes
            .iter()
            .enumerate()
            .map(|(index, label)| (label.clone(), index))
            .collect()
    }

    /// Rebuilds the index from a `{label: index}` dictionary.
    pub fn from_class_dict(dict: &IndexMap<String, usize>) -> Fallible<Self> {
        let labels: Vec<_> = dict
            .iter()
            .map(|(label, &index)| (index, label.clone()))
            .sorted()
            .collect();
        let contiguous = labels
            .iter()
            .enumerate()
            .all(|(expect, (index, _))| expect == *index);
        if !contiguous {
            return Err(Error::configuration(
                "class_dict indices are not contiguous from 0",
            ));
        }
        Self::from_labels(labels.into_iter().map(|(_, label)| label))
    }
}

impl Serialize for ClassIndex {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.class_dict().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ClassIndex {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let dict = IndexMap::<String, usize>::deserialize(deserializer)?;
        Self::from_class_dict(&dict).map_err(|err| D::Error::custom(err.to_string()))
    }
}

impl Display for ClassIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self
            .classes
            .iter()
            .enumerate()
            .map(|(index, label)| format!("{}: {}", label, index))
            .join(", ");
        write!(f, "{{{}}}", text)
    }
}
