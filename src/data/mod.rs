// Data module - FSVQA corpus sampling, cached datasets and batching

pub mod dataset;
pub mod fsvqa;
pub mod loader;
pub mod sampler;

pub use dataset::{GenVqaDataset, InMemoryDataset, VqaDataset, VqaSample};
pub use fsvqa::{
    read_subset, Annotation, Answer, Question, SampledSubset, ANNOTATIONS_FILENAME,
    QUESTIONS_FILENAME,
};
pub use loader::{collate, BatchLoader, VqaBatch};
pub use sampler::{save_subset, FsvqaSampler, SAMPLER_CHANNEL};
