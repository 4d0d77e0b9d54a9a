pub mod host;
pub mod subject;
