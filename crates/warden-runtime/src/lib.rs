//! # warden-runtime
//!
//! The supervisor's state layer: container objects and their lifecycle
//! state machine, the schema-driven property and data maps, per-container
//! persistence, the holder with its name index and id allocator, and the
//! scheduled-event queue the slave's loop drains.
//!
//! Nothing here talks to clients; the daemon crate wires the holder into
//! the RPC surface and the master/slave process pair.

pub mod container;
pub mod context;
pub mod event;
pub mod holder;
pub mod kv;
pub mod property;
