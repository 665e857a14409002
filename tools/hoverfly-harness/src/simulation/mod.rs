//! Simulation documents and the rules for choosing, combining and cleaning them.

pub mod descriptor;
pub mod document;
pub mod freshness;
pub mod merger;
pub mod sanitizer;
