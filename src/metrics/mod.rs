// Metrics module
// Batch classification metrics and corpus-level qualitative metrics

pub mod classification;
pub mod qualitative;

pub use classification::{batch_accuracy, batch_f1};
pub use qualitative::{jaccard, rouge_l, MetricCalculator, METRIC_NAMES};
