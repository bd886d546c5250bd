use std::fmt;

/// Phases reported while selecting the regularization strength.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrainingStage {
    CrossValidation,
    FinalFit,
}

impl TrainingStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::CrossValidation => "cross-validation",
            Self::FinalFit => "final fit",
        }
    }
}

impl fmt::Display for TrainingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for cross-validation progress. Fold fits run on the rayon pool, so
/// implementations receive calls from several threads at once.
pub trait CrossValidationProgress: Sync {
    fn on_stage_start(&self, stage: TrainingStage, total_fits: usize) {
        let _ = (stage, total_fits);
    }
    fn on_fit_complete(&self, fold: usize, lambda: f64, held_out_loss: f64) {
        let _ = (fold, lambda, held_out_loss);
    }
    fn on_stage_finish(&self, stage: TrainingStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl CrossValidationProgress for NoopProgress {}
