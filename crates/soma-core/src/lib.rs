pub mod calibration;
pub mod chromaticity;
pub mod config;
pub mod coupling;
pub mod decision;
pub mod dictionary;
pub mod error;
pub mod fit;
pub mod io;
pub mod ledger;
pub mod paths;
pub mod pipeline;
pub mod sad;
pub mod stage;
pub mod store;
pub mod sync;
pub mod tfs;
pub mod tool_runner;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{Result, SomaError};
