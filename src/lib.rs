//! Dispatches loosely delimited multimodal requests to locally cached models.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod dispatcher;
pub mod error;
pub mod inference;
pub mod media;
pub mod recovery;
pub mod repository;
pub mod telemetry;

pub use cache::{CacheSettings, ModelCache};
pub use dispatcher::{DispatchRequest, Dispatcher};
