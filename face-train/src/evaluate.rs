//! Multi-class evaluation on the test split.

use crate::{
    common::*,
    data::{ClassIndex, DatasetSplit, SplitEntry},
};
use prettytable::{cell, row, Cell, Row, Table};

/// A model that classifies a batch without updating weights.
pub trait Predict {
    /// Returns the highest-scoring class index of each example.
    fn predict(&self, batch: &[SplitEntry]) -> Result<Vec<usize>>;
}

/// Precision, recall and F1 of one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub label: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Averaged metrics over classes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AverageMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// The classification report and confusion matrix of a test run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub classes: Vec<String>,
    pub per_class: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: AverageMetrics,
    pub weighted_avg: AverageMetrics,
    /// Rows are true classes, columns are predicted classes.
    #[serde(serialize_with = "serialize_matrix")]
    pub confusion: Array2<usize>,
    pub total: usize,
}

impl EvaluationReport {
    pub fn from_predictions(
        class_index: &ClassIndex,
        targets: &[usize],
        predictions: &[usize],
    ) -> Fallible<Self> {
        let num_classes = class_index.len();

        if targets.len() != predictions.len() {
            return Err(Error::data(format!(
                "{} targets but {} predictions",
                targets.len(),
                predictions.len()
            )));
        }
        if targets.is_empty() {
            return Err(Error::data("the test split is empty"));
        }

        let mut confusion = Array2::<usize>::zeros((num_classes, num_classes));
        for (&target, &prediction) in izip!(targets, predictions) {
            if target >= num_classes || prediction >= num_classes {
                return Err(Error::data(format!(
                    "class index out of range: target {}, prediction {}",
                    target, prediction
                )));
            }
            confusion[[target, prediction]] += 1;
        }

        let total = targets.len();
        let correct: usize = confusion.diag().sum();
        let accuracy = correct as f64 / total as f64;

        let per_class: Vec<_> = (0..num_classes)
            .map(|class| {
                let tp = confusion[[class, class]];
                let support: usize = confusion.row(class).sum();
                let predicted: usize = confusion.column(class).sum();
                let precision = ratio(tp, predicted);
                let recall = ratio(tp, support);
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };

                ClassMetrics {
                    label: class_index.label(class).unwrap_or_default().to_owned(),
                    precision,
                    recall,
                    f1,
                    support,
                }
            })
            .collect();

        let macro_avg = {
            let mean = |get: fn(&ClassMetrics) -> f64| {
                per_class.iter().map(get).sum::<f64>() / num_classes as f64
            };
            AverageMetrics {
                precision: mean(|metrics| metrics.precision),
                recall: mean(|metrics| metrics.recall),
                f1: mean(|metrics| metrics.f1),
                support: total,
            }
        };
        let weighted_avg = {
            let mean = |get: fn(&ClassMetrics) -> f64| {
                per_class
                    .iter()
                    .map(|metrics| get(metrics) * metrics.support as f64)
                    .sum::<f64>()
                    / total as f64
            };
            AverageMetrics {
                precision: mean(|metrics| metrics.precision),
                recall: mean(|metrics| metrics.recall),
                f1: mean(|metrics| metrics.f1),
                support: total,
            }
        };

        Ok(Self {
            classes: class_index.labels().map(|label| label.to_owned()).collect(),
            per_class,
            accuracy,
            macro_avg,
            weighted_avg,
            confusion,
            total,
        })
    }

    /// The per-class report in the usual classification report layout.
    pub fn report_table(&self) -> Table {
        let mut table = Table::new();
        table.add_row(row!["class", "precision", "recall", "f1-score", "support"]);

        for metrics in &self.per_class {
            table.add_row(row![
                metrics.label,
                format!("{:.4}", metrics.precision),
                format!("{:.4}", metrics.recall),
                format!("{:.4}", metrics.f1),
                metrics.support
            ]);
        }

        table.add_row(row!["accuracy", "", "", format!("{:.4}", self.accuracy), self.total]);
        for (name, avg) in [("macro avg", &self.macro_avg), ("weighted avg", &self.weighted_avg)] {
            table.add_row(row![
                name,
                format!("{:.4}", avg.precision),
                format!("{:.4}", avg.recall),
                format!("{:.4}", avg.f1),
                avg.support
            ]);
        }

        table
    }

    /// The confusion matrix with true classes as rows.
    pub fn confusion_table(&self) -> Table {
        let mut table = Table::new();

        let header: Vec<_> = std::iter::once(Cell::new("true \\ pred"))
            .chain(self.classes.iter().map(|label| Cell::new(label)))
            .collect();
        table.add_row(Row::new(header));

        for (label, row) in izip!(&self.classes, self.confusion.rows()) {
            let cells: Vec<_> = std::iter::once(Cell::new(label))
                .chain(row.iter().map(|count| Cell::new(&count.to_string())))
                .collect();
            table.add_row(Row::new(cells));
        }

        table
    }
}

impl Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.report_table())?;
        write!(f, "{}", self.confusion_table())
    }
}

/// Runs the model over a split and builds the report.
pub fn evaluate<P>(
    model: &P,
    split: &DatasetSplit,
    class_index: &ClassIndex,
    batch_size: usize,
) -> Fallible<EvaluationReport>
where
    P: Predict,
{
    if split.is_empty() {
        return Err(Error::data(format!("the {} split is empty", split.kind)));
    }

    let mut predictions = Vec::with_capacity(split.len());
    for batch in split.entries.chunks(batch_size.max(1)) {
        let batch_predictions = model
            .predict(batch)
            .map_err(|err| Error::data(format!("evaluation failed: {:#}", err)))?;
        predictions.extend(batch_predictions);
    }
    let targets: Vec<_> = split.iter().map(|entry| entry.class).collect();

    let report = EvaluationReport::from_predictions(class_index, &targets, &predictions)?;
    info!("evaluation on {} examples, accuracy {:.4}", report.total, report.accuracy);
    info!("classification report\n{}", report.report_table());
    info!("confusion matrix\n{}", report.confusion_table());

    Ok(report)
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn serialize_matrix<S>(matrix: &Array2<usize>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let rows: Vec<Vec<usize>> = matrix.rows().into_iter().map(|row| row.to_vec()).collect();
    rows.serialize(serializer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn class_index() -> ClassIndex {
        ClassIndex::from_labels(["unknown", "alice", "bob"]).unwrap()
    }

    #[test]
    fn confusion_matrix_test() -> Result<()> {
        let targets = [0, 0, 0, 1, 1, 2, 2, 2, 2];
        let predictions = [0, 1, 0, 1, 1, 2, 0, 2, 2];
        let report = EvaluationReport::from_predictions(&class_index(), &targets, &predictions)?;

        // row sums equal support
        for (class, row) in report.confusion.rows().into_iter().enumerate() {
            let support = targets.iter().filter(|&&target| target == class).count();
            assert_eq!(row.sum(), support);
            assert_eq!(report.per_class[class].support, support);
        }

        // trace over total equals accuracy
        let trace: usize = report.confusion.diag().sum();
        assert_abs_diff_eq!(report.accuracy, trace as f64 / report.total as f64);
        assert_abs_diff_eq!(report.accuracy, 7.0 / 9.0);

        let unknown = &report.per_class[0];
        assert_abs_diff_eq!(unknown.precision, 2.0 / 3.0);
        assert_abs_diff_eq!(unknown.recall, 2.0 / 3.0);
        let alice = &report.per_class[1];
        assert_abs_diff_eq!(alice.precision, 2.0 / 3.0);
        assert_abs_diff_eq!(alice.recall, 1.0);
        assert_abs_diff_eq!(alice.f1, 0.8, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn absent_prediction_has_zero_precision_test() -> Result<()> {
        let report = EvaluationReport::from_predictions(&class_index(), &[0, 1, 2], &[0, 0, 0])?;
        assert_eq!(report.per_class[1].precision, 0.0);
        assert_eq!(report.per_class[1].f1, 0.0);
        assert_abs_diff_eq!(report.macro_avg.recall, 1.0 / 3.0);
        Ok(())
    }

    #[test]
    fn report_json_test() -> Result<()> {
        let report = EvaluationReport::from_predictions(&class_index(), &[0, 1, 2], &[0, 1, 1])?;
        let value = serde_json::to_value(&report)?;
        assert_eq!(value["confusion"], serde_json::json!([[1, 0, 0], [0, 1, 0], [0, 1, 0]]));
        assert_eq!(value["classes"][2], "bob");
        Ok(())
    }

    #[test]
    fn mismatched_lengths_test() {
        let result = EvaluationReport::from_predictions(&class_index(), &[0, 1], &[0]);
        assert!(matches!(result, Err(Error::Data(_))));
    }
}
