//! Forecasting model lifecycle: training, validation, shadow deployment and
//! promotion

mod forecaster;
mod manager;
mod sampling;

pub use forecaster::{Forecast, Forecaster, ModelTrainer, SeasonalProfile, SeasonalProfileTrainer, SlotStats};
pub use manager::{CandidateOutcome, CycleReport, ModelLifecycleManager, RetrainReason, ShadowReview};
pub use sampling::{band_rate, mean_absolute_error, sample_readings, sampling_horizon, split_holdout, HOLDOUT_RATIO};
