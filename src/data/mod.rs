//! Data layer module
//!
//! Persistence for users, records, attachments, pending deliveries,
//! and learned peer metadata.

mod database;
mod models;

pub use database::Database;
pub use models::*;
