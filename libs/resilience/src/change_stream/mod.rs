//! Resumable per-collection change feeds.

pub mod config;
pub mod event;
pub mod manager;
pub mod source;
pub mod token_store;

pub use config::ChangeStreamConfig;
pub use event::{ChangeEvent, ChangeOperation, ResumeToken};
pub use manager::{ChangeListener, ChangeNotification, ChangeStreamManager, ChangeStreamStatus, ListenerId};
pub use source::{ChangeFeed, ChangeFeedSource, ClientFeedSource, ManagedFeedSource};
pub use token_store::{MemoryTokenStore, ResumeTokenStore};
