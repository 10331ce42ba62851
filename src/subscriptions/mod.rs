//! Subscription system for streaming tree state to clients.
//!
//! Two layers:
//! - [`SubscriptionManager`] is the registry the tree store publishes
//!   changes into. Each registration has a bounded buffer; slow
//!   subscribers are dropped instead of blocking writers.
//! - The dispatcher runs one session per stream, driven by in-band
//!   [`SubscribeRequest`] control messages, and emits notifications,
//!   sync markers and heartbeats.
//!
//! Sessions support three modes:
//! - `Stream`: snapshot, `Sync { request_id: 0 }`, then live coalesced updates
//! - `Once`: snapshot and sync marker, then the stream closes
//! - `Poll`: snapshot and sync marker on each `Poll` control message
//!
//! # Example
//!
//! ```ignore
//! let (control, requests) = crossbeam_channel::unbounded();
//! let handle = target.subscribe(requests)?;
//!
//! control.send(SubscribeRequest::Subscribe(SubscriptionList::new(
//!     SubscriptionMode::Stream,
//!     vec![Subscription::new("/interfaces")],
//! )))?;
//!
//! loop {
//!     match handle.recv() {
//!         Ok(Ok(SubscribeResponse::Update(n))) => println!("update: {:?}", n),
//!         Ok(Ok(SubscribeResponse::Sync { .. })) => println!("in sync"),
//!         Ok(Ok(SubscribeResponse::Heartbeat)) => {}
//!         Ok(Err(status)) => break eprintln!("stream failed: {}", status),
//!         Err(_) => break,
//!     }
//! }
//! ```

mod coalesce;
pub(crate) mod dispatcher;
mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{
    AliasDeclaration, DropReason, SessionHandle, SessionState, StreamItem, SubscribeRequest,
    SubscribeResponse, Subscription, SubscriptionId, SubscriptionList, SubscriptionMode,
    TreeEvent,
};
