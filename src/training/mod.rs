// Training module - orchestration, loss, running statistics and checkpoints

pub mod checkpoint;
pub mod loss;
pub mod state;
pub mod trainer;

pub use checkpoint::{CheckpointManager, RESULTS_FILENAME};
pub use loss::masked_cross_entropy;
pub use state::{Averages, BestAccuracy, EpochResult, RunningStats, ValidationResults};
pub use trainer::{
    train_channel, StepOutput, TrainerOptions, TrainingSummary, VqaTrainer,
    TRAIN_TEACHER_FORCE_RATIO,
};
