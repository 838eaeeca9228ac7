//! Device pairing, connection registry and command fanout for remote agents.
//!
//! Any number of instances share one store. An agent holds a websocket to
//! exactly one of them; a command request can land on any other, which
//! reaches the agent through the fleet-wide fanout topic and collects results
//! on a per-batch topic.

pub mod agent;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod fanout;
pub mod ids;
pub mod pairing;
pub mod registry;
pub mod routes;
pub mod server;
pub mod session;
pub mod state;
pub mod store;
pub mod system_info;
pub mod telemetry;
