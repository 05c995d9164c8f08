//! Central-side driver for the BBC micro:bit Bluetooth profile.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{Error, Result, TransportError};
pub use infrastructure::bluetooth::MicrobitService;
