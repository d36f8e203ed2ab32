//! Market Store - commodity order book and price history cache
//!
//! This crate keeps a local SQLite cache of regional order books and daily
//! trade histories current against the rate-limited ESI read API, and derives
//! a volume-weighted global history per item type.

// Module declarations
pub mod domain;
pub mod application;
pub mod infrastructure;
