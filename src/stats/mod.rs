//! Data-plane statistics: transport (query RPC) and collector (attribution).

pub mod collector;
pub mod transport;

pub use collector::{CollectorHealth, CollectorStatus, StatsCollector};
pub use transport::{
    CliStatTransport, DualStatTransport, HttpStatTransport, StatAnswer, StatTransport,
    TransportError,
};
