//! Notification bus for live index updates.
//!
//! Events:
//! - `index-change` with recomputed counts
//! - `isread` for every identity marked read or unread
//! - domain events forwarded from the classifier
//!
//! The bus stays silent until the initial backlog has been indexed, and
//! drops subscribers whose buffers overflow.
//!
//! # Example
//!
//! ```ignore
//! let events = indexer.subscribe_with(BusConfig { buffer_size: 64 });
//!
//! loop {
//!     match events.recv() {
//!         Ok(IndexEvent::IndexChange { index, unread, .. }) => println!("{index}: {unread} unread"),
//!         Ok(IndexEvent::Dropped { .. }) | Err(_) => break,
//!         Ok(_) => {}
//!     }
//! }
//! ```

mod bus;
mod types;

pub use bus::NotificationBus;
pub use types::{BusConfig, DropReason, EventSubscription, IndexEvent, SubscriptionId};
