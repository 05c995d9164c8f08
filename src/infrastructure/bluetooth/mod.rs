//! Bluetooth Module
//!
//! Provides BLE communication with a BBC micro:bit.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    MicrobitService                       │
//! │  (Public API: fire-and-forget commands, observed state)  │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//!              ┌─────────────────┐
//!              │ CommandExecutor │  one command at a time, FIFO
//!              └────────┬────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────┐   ┌──────────┐
//! │ Central (connection + gatt)          │──▶│ Protocol │
//! │ - scan / connect / discover          │   │ - UUIDs  │
//! │ - single-shot reads, writes, notify  │   │ - codecs │
//! └─────────────────────┬────────────────┘   └──────────┘
//!                       │ requests ▲ events
//!                       ▼          │
//!              ┌─────────────────────────┐
//!              │ Transport               │
//!              │ (radio or simulator)    │
//!              └─────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Profile registry: service/characteristic UUIDs and value codecs
//! - [`transport`] - The radio seam: requests and events
//! - [`connection`] - Connection state machine
//! - [`gatt`] - Typed GATT operations and notification routing
//! - [`executor`] - Serialized command queue
//! - [`service`] - Main service facade
//! - [`simulator`] - In-process micro:bit

pub mod connection;
pub mod executor;
pub mod gatt;
pub mod protocol;
pub mod service;
pub mod simulator;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-export main service for convenience
pub use connection::{Central, CentralConfig};
pub use service::MicrobitService;
pub use simulator::{SimulatedMicrobit, SimulatorConfig};
pub use transport::{Transport, TransportEvent};
