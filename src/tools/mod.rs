pub mod base;
pub mod cron;
pub mod executor;
pub mod filesystem;
pub mod http;
pub mod message;
pub mod registry;
pub mod sessions;
pub mod shell;
pub mod spawn;
pub mod web;

pub use base::Tool;
pub use cron::CronTools;
pub use executor::{ConfirmationStore, PendingConfirmation, ToolExecutor};
pub use registry::ToolRegistry;
