//! Hardware abstraction traits for IoT firmware
//!
//! This crate defines the seams between the peripheral drivers and the
//! collaborators they consume. Drivers implement [`ByteStream`]; boards and
//! protocol crates implement [`DhcpClient`].

#![no_std]
#![deny(unsafe_code)]
#![deny(warnings)]

use core::net::Ipv4Addr;

/// Byte-stream capability shared by sockets and any stream-like driver
///
/// `read`/`write`/`flush` come from `embedded-io`; this trait adds the two
/// buffer-level queries the drivers expose.
pub trait ByteStream: embedded_io::Read + embedded_io::Write {
    /// Number of bytes waiting in the receive buffer
    fn available(&mut self) -> Result<usize, Self::Error>;

    /// Number of bytes of free space in the transmit buffer
    fn room(&mut self) -> Result<usize, Self::Error>;
}

/// Network configuration handed out by a DHCP server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Ipv4Addr,
}

/// DHCP client collaborator
///
/// `N` is the network controller the client runs its exchange over. The
/// client must give up and return an error once `timeout_ms` worth of
/// retries is spent.
pub trait DhcpClient<N: ?Sized> {
    /// Client specific failure
    type Error: core::fmt::Debug;

    /// Run discover/request and return the acquired lease
    fn lease(
        &mut self,
        net: &mut N,
        hostname: &str,
        mac: [u8; 6],
        timeout_ms: u16,
    ) -> Result<Lease, Self::Error>;
}
