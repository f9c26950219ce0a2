pub mod config;
pub mod layout;

// Re-export key types for easier use by dependent crates
pub use config::{SimConfig, StepProbabilities};
pub use layout::{RankGrid, Region, SlabLayout};
