//! Infrastructure layer for remote access, persistence and process setup
//!
//! This module provides the admission controller and cooldown clock shared by
//! every remote call, the ESI client itself, SSO token handling, the SQLite
//! store, configuration and logging.

pub mod config;
pub mod cooldown;
pub mod database_connection;
pub mod esi_client;
pub mod esi_error;
pub mod logging;
pub mod priority_semaphore;
pub mod secrets;
pub mod sqlite_store;
pub mod sso;

// Re-export commonly used items
pub use config::{AppConfig, ConfigManager};
pub use cooldown::CooldownClock;
pub use database_connection::DatabaseConnection;
pub use esi_client::{EsiClient, EsiRequest, EsiResponse};
pub use esi_error::FetchError;
pub use priority_semaphore::{PrioritySemaphore, Ticket};
pub use secrets::{SecretError, SecretManager, SecretSource};
pub use sqlite_store::SqliteStore;
pub use sso::SsoTokenCache;
