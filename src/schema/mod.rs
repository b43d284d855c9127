//! Schema module - configuration types for reactive-transport simulations.

mod config;

pub use config::*;
