// GenVQA - generative visual question answering
// Library exports

pub mod config;
pub mod data; // FSVQA sampling, cached datasets, batching
pub mod decoding;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod models; // Encoder + RNN/attention-RNN/Transformer decoders
pub mod training; // Orchestrator, loss and checkpoints

pub use errors::{VqaError, VqaResult};
