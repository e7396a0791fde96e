//! Attribute server for a battery peripheral with over-the-air firmware upgrade.
//!
//! The library is transport agnostic: a BLE stack hands decoded ATT requests to
//! [`GattServer::process`] and receives encoded responses, notifications and
//! indications back through the [`Transport`] trait. The firmware binary in
//! `src/main.rs` wires it to trouble-host on an nRF52840.

#![cfg_attr(not(test), no_std)]

pub mod att;
pub mod battery;
pub mod config;
pub mod error;
pub mod reassembly;
pub mod schema;
pub mod sender;
pub mod server;
pub mod store;
pub mod table;
pub mod upgrade;

pub use att::{AttributeType, Opcode, Request, Response};
pub use config::ServerConfig;
pub use error::{AttError, RequestError};
pub use schema::ServiceHandles;
pub use sender::Transport;
pub use server::{Action, GattServer};
pub use store::{ImageStore, RamImageStore};
pub use table::AttributeTable;
pub use upgrade::{UpgradeSession, UpgradeState, UpgradeStatus};

/// Identifies one peer association for as long as the link is up.
pub type ConnectionId = u16;

/// Opaque attribute handle.
pub type Handle = u16;
