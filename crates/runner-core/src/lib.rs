pub mod config;
pub mod events;
pub mod partition;
pub mod report;
pub mod retry;
pub mod types;

pub use config::Config;
pub use report::{ReportRow, ReportWriter};
pub use types::*;
