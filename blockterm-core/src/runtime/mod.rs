//! Command-line analysis that happens before anything reaches the connection.

pub mod classifier;

pub use classifier::{
    ArgCondition, ClassificationRule, Classification, Classifier, CommandProfile, Outcome,
};
