pub mod config;
pub mod error;
pub mod remote;
pub mod runner;
pub mod scheduler;
pub mod shutdown;
pub mod ssh;

pub use error::{Result, RunnerError};
pub use runner::Runner;
