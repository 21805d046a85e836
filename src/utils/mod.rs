//! Small shared utilities: smoothing windows, runtime counters, the
//! diagnostic log sink and session export.

pub mod counters;
pub mod export;
pub mod filter;
pub mod logfile;
