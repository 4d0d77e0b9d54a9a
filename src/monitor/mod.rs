pub mod deadline;
pub mod domain;
pub mod heartbeat;
pub mod pipeline;
pub mod timing;
pub mod traits;
pub mod verdict;
