#![recursion_limit = "256"]
pub mod checkpoint;
pub mod data;
pub mod metrics;
pub mod model;
pub mod training;
pub mod utils;
