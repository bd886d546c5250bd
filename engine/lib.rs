#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod config;
pub mod crossval;
pub mod estimate;
pub mod labels;
pub mod loss;
pub mod matrix;
pub mod mix;
pub mod model;
pub mod optimize;
pub mod pipeline;
pub mod progress;
pub mod sample;
pub mod synthetic;
pub mod types;

pub use estimate::{Estimator, EstimationError, WeightSource, estimate};
pub use labels::{Category, CategorySet, LabelMap};
pub use matrix::ExpressionMatrix;
pub use model::Model;
pub use types::FeatureWeights;
