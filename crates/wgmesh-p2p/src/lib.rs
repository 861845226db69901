//! Private gossip overlay transport
//!
//! Joins the PSK-gated libp2p fabric, publishes and consumes presence
//! announcements on a single topic, observes which transport addresses
//! are actually in use, and keeps the persisted bootstrap list aligned
//! with live mesh membership.

pub mod behaviour;
mod bootstrap;
pub mod error;
pub mod worker;

pub use behaviour::ANNOUNCE_TOPIC;
pub use error::P2pError;
pub use worker::P2pWorker;
