//! The HTTP surface of the gateway and the dispatch pipeline behind it.

pub mod dispatcher;
pub mod forwarder;
pub mod server;

pub use dispatcher::{Dispatcher, InboundRequest, Stage};
pub use forwarder::{HttpUpstreamClient, UpstreamClient};
pub use server::{AppState, Collaborators, GatewayServer};
