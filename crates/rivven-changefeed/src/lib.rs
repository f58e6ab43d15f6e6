//! rivven-changefeed - Lease-based change feed processing for Rivven
//!
//! A fleet of hosts consumes one range-partitioned change feed together. Every
//! feed range is represented by a lease; a host processes a range only while it
//! owns the lease, checkpoints progress into it, and hands it back when it
//! stops. Partition splits and merges are reconciled into new leases without
//! losing progress.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                ChangeFeedProcessor (one per host)               │
//! │  Bootstrapper ─ once per lease store, migrates legacy leases    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  PartitionLoadBalancer ── strategy ──> leases to take           │
//! │           │                                                     │
//! │           v                                                     │
//! │  PartitionController ── acquire / release / split / merge       │
//! │           │                                                     │
//! │           v  one per owned lease                                │
//! │  PartitionSupervisor                                            │
//! │  ├── PartitionProcessor  read ─> observer ─> checkpoint         │
//! │  └── LeaseRenewer        renew while progress is made           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  LeaseManager / LeaseContainer / LeaseStore                     │
//! │  ChangeFeedReader / PartitionKeyRangeProvider                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - The lease store's conditional update is the only arbiter of ownership.
//! - A page is checkpointed only after the observer accepted it.
//! - Stopping a host drains every partition before its lease is released.
//!
//! # Usage
//!
//! ```rust,ignore
//! use rivven_changefeed::{
//!     ChangeFeedProcessor, DocumentLeaseManager, FnObserverFactory, InMemoryChangeFeed,
//!     InMemoryDocumentStore, ProcessorOptions,
//! };
//!
//! let feed = Arc::new(InMemoryChangeFeed::new("orders", 4));
//! let store = Arc::new(InMemoryDocumentStore::new());
//! let options = ProcessorOptions::builder().host_name("worker-1").build()?;
//!
//! let processor = ChangeFeedProcessor::builder()
//!     .leases(Arc::new(DocumentLeaseManager::new(store, "orders.", "worker-1")))
//!     .feed(feed)
//!     .observer_factory(Arc::new(FnObserverFactory::new(|ctx, changes| async move {
//!         println!("{}: {} changes", ctx.lease_token, changes.len());
//!         Ok(())
//!     })))
//!     .options(options)
//!     .build()?;
//!
//! processor.start().await?;
//! ```

pub mod balancer;
pub mod bootstrap;
pub mod config;
pub mod controller;
pub mod error;
pub mod feed;
pub mod host;
pub mod lease;
pub mod observer;
pub mod processor;
pub mod range;
pub mod renewer;
pub mod simulation;
pub mod state;
pub mod supervisor;
pub mod sync;

pub use balancer::{
    EqualPartitionsBalancingStrategy, PartitionLoadBalancer, PartitionLoadBalancingStrategy,
};
pub use bootstrap::{BootstrapOutcome, Bootstrapper, LeaseScheme, LegacyLeases};
pub use config::{ProcessorOptions, ProcessorOptionsBuilder};
pub use controller::PartitionController;
pub use error::{ChangeFeedError, Result};
pub use feed::{ChangeFeedReader, FeedPage, PartitionKeyRangeProvider};
pub use host::{ChangeFeedProcessor, ChangeFeedProcessorBuilder, LeaseStateInfo};
pub use lease::{
    DocumentLeaseManager, InMemoryDocumentStore, Lease, LeaseContainer, LeaseDocumentStore,
    LeaseManager, LeaseSchemeVersion, LeaseStore, StoredDocument,
};
pub use observer::{
    ChangeFeedObserver, ChangeFeedObserverFactory, CloseReason, FnObserverFactory,
    ObserverContext,
};
pub use processor::{PartitionCheckpointer, PartitionProcessor};
pub use range::{PartitionKeyRange, Range};
pub use renewer::LeaseRenewer;
pub use simulation::InMemoryChangeFeed;
pub use state::{
    ChangeFeedMode, ChangeFeedStartFrom, ChangeFeedState, CompositeContinuationToken, FeedRange,
};
pub use supervisor::{
    DefaultPartitionSupervisorFactory, Liveness, PartitionSupervisor, PartitionSupervisorFactory,
};
pub use sync::{
    FeedRangeGoneHandler, FeedRangeGoneMergeHandler, FeedRangeGoneSplitHandler,
    PartitionSynchronizer, RangePartitionSynchronizer,
};
