//! iothub: control plane for a multi-tenant IoT platform
//!
//! Every tenant with at least one product gets its own broker service on a
//! pluggable cluster backend. The hub keeps an in-memory model of tenants and
//! products in step with the backend and a persistent state store, and drives
//! both from notifications arriving on the message bus.

pub mod backend;
pub mod bus;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod hub;
pub mod model;
pub mod store;
