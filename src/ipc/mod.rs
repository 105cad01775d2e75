// src/ipc/mod.rs

//! Shared IPC building blocks used by the hub, the hub client, and every
//! role process: the wire payload format, task supervision, the presence
//! registry, the callback-based request/reply engine, command/event
//! dispatch, reconnect backoff, and the hub client itself.

pub mod backoff;
pub mod callbacks;
pub mod client;
pub mod dispatch;
pub mod payload;
pub mod registry;
pub mod tasks;

pub use callbacks::{CallbackHandler, CallbackResult};
pub use client::{HubClient, HubClientConfig};
pub use dispatch::{CommandGroup, CommandOutcome, EventGroup};
pub use payload::{CallbackId, Payload, PresenceFrame, Uid};
pub use registry::{BrainInfo, ClusterInfo, PresenceRegistry, ServerInfo};
pub use tasks::TaskSupervisor;
