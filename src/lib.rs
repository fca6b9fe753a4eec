pub mod config;
pub mod engine;
pub mod error;
pub mod invoice;
pub mod order;
pub mod policy;
pub mod scoring;
pub mod shipment;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod users;
pub mod utils;
pub mod validators;

pub use engine::Workflow;
pub use error::{ErrorKind, WorkflowError};
pub use types::{Actor, Outcome, Role};
