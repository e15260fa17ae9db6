// lib.rs
//
// Cohort partitioning and per-node cross-validation preparation.

pub mod align;
pub mod config;
pub mod error;
pub mod extract;
pub mod folds;
pub mod layout;
pub mod loader;
pub mod partition;
pub mod pipeline;
pub mod repartition;
pub mod standardize;
pub mod table;

pub use config::SplitConfig;
pub use error::{Result, SplitError};
pub use layout::{Layout, NodeId, Part};
