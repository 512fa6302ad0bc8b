//! glink control plane over UDP: coordinator server with clusters, worker client.

pub mod client;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod input;
pub mod peer;
pub mod server;

pub use client::{Client, ClientConfig, ClientState, Session};
pub use cluster::Cluster;
pub use config::{Config, ConfigError};
pub use error::{RdpError, Result};
pub use health::{MetricsSource, StaticMetrics, SystemMetrics};
pub use input::{Event, InputStream};
pub use peer::{Peer, PeerSelector};
pub use server::{Listener, Server, ServerConfig};
