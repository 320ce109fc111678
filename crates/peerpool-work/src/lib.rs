//! Work generation: turns Bitcoin block templates into Stratum jobs and
//! miner submissions back into full Bitcoin blocks.

pub mod generator;
pub mod template;

pub use generator::{Generator, GeneratorConfig};
pub use template::{Job, WorkError};
