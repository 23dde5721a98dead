//! MongoDB adapters for the store seams
//!
//! [`MongoConnector`] plugs the official driver into the connection
//! manager, [`MongoFeedSource`] and [`MongoTokenStore`] back change streams.
//! Driver errors convert into [`DriverError`](crate::classification::DriverError)
//! here and nowhere else.

mod config;
mod connector;
mod error;
mod feed;
mod token_store;

pub use config::MongoConfig;
pub use connector::MongoConnector;
pub use feed::MongoFeedSource;
pub use token_store::{MongoTokenStore, RESUME_TOKEN_COLLECTION};

// Re-export MongoDB types for convenience
pub use mongodb::{Client, Collection, Database};
