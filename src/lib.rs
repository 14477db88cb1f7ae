//! Exactly-once processing core of a MillWheel-style stream engine.
//!
//! Records are delivered at least once by a [`delivery::sender::Sender`]
//! and made exactly-once by the receiving [`node::ComputationNode`]:
//! each key's worker drops records its [`dedup::TwoTierDedup`] filter
//! has seen committed, runs the user's [`node::Logic`] on the rest, and
//! commits the new state together with the record IDs as one atomic
//! [`store::Checkpoint`]. Only then is anything sent downstream or
//! acknowledged upstream.
//!
//! Ownership of key-ranges is fenced with epochs issued by a
//! [`fencing::FencingAuthority`] and checked by the [`store::StateStore`]
//! on every write, so a node that lost its range can't commit even if
//! it is still running.
//!
//! ```ignore
//! let store = Arc::new(SqliteStore::open(path)?);
//! run_main(
//!     EngineConfig::default().from_env()?,
//!     None,
//!     |config| {
//!         ComputationNode::new(HolderId::from("node1"), CountLogic, store, Arc::new(Discard), config)
//!     },
//!     |node, _events| async move {
//!         node.acquire(KeyRange::full()).await?;
//!         node.process(Record::new("cat", "meow")).await
//!     },
//! )?;
//! ```

pub mod checkpoint;
pub mod config;
pub mod dedup;
pub mod delivery;
pub mod errors;
pub mod fencing;
pub mod metrics;
pub mod node;
pub mod record;
pub mod retry;
pub mod run;
pub mod store;
pub mod tracing;
pub mod webserver;

pub use config::EngineConfig;
pub use errors::EngineError;
pub use fencing::HolderId;
pub use fencing::KeyRange;
pub use node::ComputationNode;
pub use node::Logic;
pub use node::Outcome;
pub use record::Key;
pub use record::Record;
pub use record::RecordId;
pub use run::run_main;
