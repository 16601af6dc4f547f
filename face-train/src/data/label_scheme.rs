use super::LabeledRecord;
use crate::{common::*, config::LabelSchemeConfig};

/// Maps raw corpus labels to training labels.
pub trait LabelScheme
where
    Self: Debug + Send + Sync,
{
    /// Returns the training label, or `None` to drop the record.
    fn relabel<'a>(&'a self, label: &'a str) -> Option<Cow<'a, str>>;

    /// Applies the scheme to a corpus and reports the dropped records.
    fn apply(&self, records: Vec<LabeledRecord>) -> Vec<LabeledRecord> {
        let total = records.len();
        let kept: Vec<_> = records
            .into_iter()
            .filter_map(|record| {
                let label = self.relabel(&record.label)?.into_owned();
                Some(LabeledRecord {
                    path: record.path,
                    label,
                })
            })
            .collect();

        if kept.len() < total {
            info!("label scheme dropped {} records", total - kept.len());
        }
        kept
    }
}

/// Keeps labels unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityScheme;

impl LabelScheme for IdentityScheme {
    fn relabel<'a>(&'a self, label: &'a str) -> Option<Cow<'a, str>> {
        Some(Cow::Borrowed(label))
    }
}

/// The alternate labeling scheme.
#[derive(Debug, Clone)]
pub struct RemapScheme {
    pub mapping: IndexMap<String, String>,
    pub fallback: Option<String>,
}

impl LabelScheme for RemapScheme {
    fn relabel<'a>(&'a self, label: &'a str) -> Option<Cow<'a, str>> {
        let new_label = self
            .mapping
            .get(label)
            .or(self.fallback.as_ref())
            .map(|label| label.as_str())
            .unwrap_or(label);

        // empty label means the record is dropped
        (!new_label.is_empty()).then(|| Cow::Borrowed(new_label))
    }
}

/// Builds the label scheme selected by the configuration.
pub fn label_scheme(config: &LabelSchemeConfig) -> Box<dyn LabelScheme> {
    match config {
        LabelSchemeConfig::Identity => Box::new(IdentityScheme),
        LabelSchemeConfig::Remap { mapping, fallback } => {
            info!("using alternate labels");
            Box::new(RemapScheme {
                mapping: mapping.clone(),
                fallback: fallback.clone(),
            })
        }
    }
}
