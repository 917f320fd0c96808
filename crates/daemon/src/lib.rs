pub mod catalog;
pub mod config;
pub mod error;
pub mod exec;
pub mod integrity;
pub mod leftovers;
pub mod ops;
pub mod paths;
pub mod probe;
pub mod queue;

pub use catalog::{CatalogClient, Movie};
pub use config::MoverConfig;
pub use error::OperationError;
pub use leftovers::LeftoversManager;
pub use ops::{ConvertOperationHandler, CopyOperationHandler};
pub use queue::{ItemStatus, OperationHandler, OperationQueue, QueueItem};
