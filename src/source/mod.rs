//! Source connector and queue clients.
//!
//! The [`SourceConnector`] owns consumer positions and turns a
//! [`QueueClient`] into bounded micro-batch polls.

pub mod connector;
pub mod log_dir;
pub mod memory;
pub mod traits;

pub use connector::SourceConnector;
pub use log_dir::LogDirQueue;
pub use memory::MemoryQueue;
pub use traits::QueueClient;
