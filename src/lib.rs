#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;
#[cfg(test)]
#[macro_use]
extern crate approx;

pub mod calling;
pub mod candidates;
pub mod cli;
pub mod constants;
pub mod errors;
pub mod genome;
pub mod hapgen;
pub mod likelihood;
pub mod model;
pub mod phaser;
pub mod reads;
pub mod reference;
pub mod utils;
pub mod variants;

/// Name of a sample as declared in the read file headers.
pub type SampleName = String;
