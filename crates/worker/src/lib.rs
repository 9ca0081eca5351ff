//! Out-of-process executor for the script queue and the background
//! expiration sweep.

pub mod config;
pub mod runner;
pub mod sweep;
