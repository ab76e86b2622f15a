//! Drivers for SPI peripherals sharing one bus
//!
//! - [`bus`]: arbitration of a single SPI bus between chip-selected devices
//! - [`flash`]: Winbond W25X40CL serial NOR flash
//! - [`w5200`]: WIZnet W5200 TCP/IP offload controller, its socket pool and
//!   a DNS resolver
//!
//! Everything is blocking and `no_std`. Drivers are written against
//! `embedded-hal` 1.0 traits, so any HAL that provides `SpiBus`, `OutputPin`
//! and `DelayNs` can host them. Logging goes to `defmt` or `log` depending on
//! the enabled feature.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]
#![deny(warnings)]

// This mod MUST go first, so that the others see its macros.
#[macro_use]
mod fmt;

pub mod bus;
pub mod config;
pub mod error;
pub mod flash;
pub mod w5200;

#[cfg(test)]
mod mock;

pub use bus::{BusArbiter, BusDevice, Transaction};
pub use config::NetworkConfig;
pub use error::Error;
pub use flash::{EraseSize, W25x40cl};
pub use w5200::dns::AddressResolver;
pub use w5200::{Accept, Protocol, Socket, SocketFlags, SocketHandle, W5200};
