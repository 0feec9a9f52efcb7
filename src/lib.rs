//! Perfscope core library: sampling lifecycle, profiler control, and report
//! reduction around automated test execution.

mod collector;
mod config;
mod error;
mod fsutil;
mod profiler;
mod report;

pub use collector::*;
pub use config::*;
pub use error::*;
pub use fsutil::*;
pub use profiler::*;
pub use report::*;
