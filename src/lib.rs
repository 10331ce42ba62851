//! # treesync
//!
//! The stateful engine behind a tree-shaped configuration and telemetry
//! protocol: a timestamped path tree, alias compression, transactional
//! writes and multiplexed subscription streams.
//!
//! ## Core Concepts
//!
//! - **Tree**: path-keyed leaves with last-modified timestamps; deletes
//!   carry a cutoff and never remove fresher data
//! - **Aliases**: `@token` stand-ins for long path prefixes, per target
//!   and per subscriber
//! - **Notifications**: prefix-compressed batches of updates and deletes
//! - **Transactions**: all-or-nothing delete/replace/update sets
//! - **Subscriptions**: stream, once and poll sessions with heartbeats
//!   and resync
//!
//! ## Example
//!
//! ```ignore
//! use treesync::{Target, TargetConfig, TypedValue, SetRequest, Update};
//!
//! let target = Target::new(TargetConfig::default());
//!
//! // Device side
//! target.publish("/interfaces/eth0/state/mtu", TypedValue::json(1500))?;
//!
//! // Client side
//! let response = target.set(
//!     SetRequest::new()
//!         .with_prefix("/interfaces/eth0/config")
//!         .update(Update::new("/mtu", TypedValue::json(9000))),
//! );
//! assert!(response.is_ok());
//! ```

pub mod alias;
pub mod config;
pub mod encap;
pub mod error;
pub mod notification;
pub mod status;
pub mod subscriptions;
pub mod target;
pub mod transaction;
pub mod tree;
pub mod types;

// Re-exports
pub use alias::{AliasOwner, AliasTable};
pub use config::TargetConfig;
pub use encap::{Envelope, EnvelopeReader, EnvelopeWriter, Gap, GapDetector, Sequencer};
pub use error::{Result, StoreError};
pub use notification::{Notification, NotificationBuilder, NotificationKind};
pub use status::{Code, Status};
pub use subscriptions::{
    AliasDeclaration, DropReason, SessionHandle, SessionState, StreamItem, SubscribeRequest,
    SubscribeResponse, Subscription, SubscriptionId, SubscriptionList, SubscriptionManager,
    SubscriptionMode, TreeEvent,
};
pub use target::{GetRequest, GetResponse, Target};
pub use transaction::{Operation, SetRequest, SetResponse, TransactionEngine, UpdateResult};
pub use tree::{Change, TreeStore};
pub use types::*;
