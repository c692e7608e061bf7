//! Core types for reflex-engine

mod fire;
mod heuristic;
mod situation;

pub use fire::*;
pub use heuristic::*;
pub use situation::*;
