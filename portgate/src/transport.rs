//! RPC plumbing between the agent and the tunnel server.

pub mod client;
pub mod connect;
pub mod message;

pub use client::TunnelServiceClient;
pub use connect::ServerTransport;
