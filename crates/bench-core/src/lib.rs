pub mod aggregator;
pub mod config;
pub mod counters;
pub mod error;
pub mod rate_controller;
pub mod runner;
pub mod sequence;
pub mod simulated;
pub mod sink;
pub mod submitter;
pub mod tracker;

pub use aggregator::*;
pub use config::*;
pub use counters::*;
pub use error::*;
pub use rate_controller::*;
pub use runner::*;
pub use sequence::*;
pub use simulated::*;
pub use sink::*;
pub use submitter::*;
pub use tracker::*;
