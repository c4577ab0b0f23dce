//! SehatLink application layer.
//!
//! The [`OfflineService`] is the only surface the UI talks to. It saves
//! records locally first, queues them for the remote authority, and lets the
//! sync engine deliver them whenever the device is online.

pub mod classifier;
pub mod config;
pub mod service;
pub mod session;

pub use classifier::{KeywordClassifier, SymptomClassifier};
pub use config::AppConfig;
pub use service::OfflineService;
pub use session::Session;
