//! # murmur-store
//!
//! In-memory conversation state for a Murmur session.
//!
//! The store is owned by a single task and is never shared; every method is
//! synchronous. It tracks the local identity, known peers with their online
//! flags, and one [`Conversation`] per peer holding the ordered message log
//! together with its unread, backfill and pagination bookkeeping.

pub mod conversation;
pub mod models;
pub mod store;

mod error;

pub use conversation::{Applied, Conversation, PageOutcome, PageRequest};
pub use error::StoreError;
pub use models::*;
pub use store::{ConversationStore, IncomingOutcome};
