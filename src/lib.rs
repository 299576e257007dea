//! StratoMQ - clustered MQTT v3.1.1/v5.0 broker
//!
//! The core is a set of components wired together by the broker: wire
//! codec, subscription index, retained-message matcher, offline queues,
//! per-client sessions, the publish router, and the cluster coordinator,
//! all over a pluggable persistence layer.

pub mod broker;
pub mod bus;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod hooks;
pub mod protocol;
pub mod queue;
pub mod retained;
pub mod router;
pub mod session;
pub mod store;
pub mod topic;
pub mod transport;

pub use broker::{Broker, BrokerConfig, Stores};
pub use cluster::ClusterCoordinator;
pub use config::Config;
pub use hooks::{AllowAll, HookChain, Hooks};
pub use protocol::{ProtocolVersion, QoS};
pub use router::{Envelope, PublishRouter};
pub use store::{FjallBackend, MemoryBackend};
