//! Supervises a subject executable, checks its heartbeat output against a
//! timing contract and classifies each run.

pub mod commands;
pub mod config;
pub mod constants;
pub mod footprint;
pub mod monitor;
pub mod native;
pub mod report;

#[cfg(test)]
pub mod stubs;
