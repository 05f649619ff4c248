//! Near Cache Client
//!
//! [`CachedMapClient`] wraps a [`RemoteMapService`] with a near cache. Reads
//! are answered locally when possible; writes go to the cluster and drop the
//! local copy. Server-pushed invalidations reach the cache through an
//! [`InvalidationHandler`] picked once from the cluster's version.

pub mod client;
pub mod handler;
pub mod remote;

pub use client::CachedMapClient;
pub use handler::{InvalidationHandler, LegacyInvalidationHandler, SequenceAwareInvalidationHandler};
pub use remote::{
    InvalidationEvent, InvalidationListener, ListenerKind, RemoteMapService, SubscriptionId,
    SubscriptionTopic,
};
