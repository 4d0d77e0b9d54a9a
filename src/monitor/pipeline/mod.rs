pub mod monitoring;
pub mod suite;
