pub mod adapters;
pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod error;
pub mod handlers;
pub mod helm;
pub mod models;
pub mod runtime;
pub mod status;
pub mod validation;

use std::sync::Arc;
use std::time::Duration;

use adapters::AdapterRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<AdapterRegistry>,
    /// Deadline applied to every adapter operation. `None` = unbounded.
    pub request_timeout: Option<Duration>,
}
