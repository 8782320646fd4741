//! Collaborator traits.
//!
//! - `store` - lookup of strategy source records
//! - `strategy` - an executable strategy class, compiled or native
//!
//! Both are object safe and `Send + Sync`, so loaders hold them as
//! `Arc<dyn ...>` across tasks.

mod store;
mod strategy;

pub use store::SourceStore;
pub use strategy::StrategyClass;
