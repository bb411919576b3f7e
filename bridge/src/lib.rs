//! BoardMail - keeps task-board cards and email threads in one conversation.
//!
//! Mail sent to an inbound address becomes a card (or a comment on the card
//! already holding the thread); comments marked with an envelope become
//! replies to the thread.
//!
//! ## Architecture
//!
//! ```text
//! Mailgun / Cloudflare → web → inbound → ingest → thread + store → board
//! Board webhook        → web → events  → reply  → store → relay
//! Address API          → web → delegation → store + relay
//! ```

pub mod address;
pub mod billing;
pub mod board;
pub mod cache;
pub mod config;
pub mod delegation;
pub mod error;
pub mod events;
pub mod inbound;
pub mod ingest;
pub mod markup;
pub mod relay;
pub mod reply;
pub mod state;
pub mod store;
pub mod subject;
pub mod thread;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use error::{BridgeError, Result};
pub use inbound::InboundMessage;
pub use ingest::{ingest, IngestOutcome};
pub use state::AppState;
pub use store::Store;
