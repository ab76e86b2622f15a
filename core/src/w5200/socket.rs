//! Socket operations on a W5200 pool entry
//!
//! The chip owns the protocol state machine; these methods check that the
//! observed status allows an operation, program the socket bank, and poll.
//!
//! TX data is staged in the socket's 2 KB TX window starting at the chip's
//! write pointer. A message is sent on `flush`, or automatically once half
//! the window is staged. RX data is read from the RX window at the chip's
//! read pointer. Offsets wrap at the window size, so a transfer that runs off
//! the end is split into two bus frames.

use core::net::{Ipv4Addr, SocketAddrV4};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use hal_abstractions::ByteStream;

use super::registers::{
    Interrupt, SocketCommand, SocketFlags, SocketRegisters, SocketStatus, BUF_MASK, BUF_MAX,
};
use super::{dns, Protocol, SocketHandle, SocketState, W5200};
use crate::error::Error;

/// Staged bytes that trigger an automatic send
pub const MSG_MAX: usize = BUF_MAX / 2;

const UDP_HEADER: usize = 8;
const IPRAW_HEADER: usize = 6;
const MACRAW_HEADER: usize = 2;

/// Outcome of polling a listening socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Accept {
    /// A peer connected; the socket is ESTABLISHED
    Established,
    /// Still listening or mid-handshake
    Pending,
}

/// TCP peers must be a single host
fn check_peer(addr: Ipv4Addr) -> Result<(), Error> {
    if addr.is_unspecified() || addr.is_broadcast() {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

/// A pool entry borrowed from its [`W5200`]
pub struct Socket<'c, 'a, M: RawMutex, B, CS, D, const N: usize> {
    net: &'c mut W5200<'a, M, B, CS, D, N>,
    index: usize,
    regs: SocketRegisters,
}

impl<'c, 'a, M, B, CS, D, const N: usize> Socket<'c, 'a, M, B, CS, D, N>
where
    M: RawMutex,
    B: SpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    pub(super) fn new(net: &'c mut W5200<'a, M, B, CS, D, N>, index: usize) -> Self {
        Self {
            net,
            index,
            regs: SocketRegisters::new(index),
        }
    }

    pub fn handle(&self) -> SocketHandle {
        SocketHandle(self.index as u8)
    }

    /// Protocol the socket was opened with, `None` when closed
    pub fn protocol(&self) -> Option<Protocol> {
        self.net.sockets[self.index].protocol
    }

    pub fn local_port(&self) -> u16 {
        self.net.sockets[self.index].port
    }

    /// Status register as reported by the chip right now
    pub fn status(&mut self) -> Result<SocketStatus, Error> {
        Ok(self.net.read_reg(self.regs.sr())?.into())
    }

    fn state(&mut self) -> &mut SocketState {
        &mut self.net.sockets[self.index]
    }

    fn open_protocol(&self) -> Result<Protocol, Error> {
        self.protocol().ok_or(Error::InvalidState)
    }

    fn expect_protocol(&self, protocol: Protocol) -> Result<(), Error> {
        if self.open_protocol()? != protocol {
            return Err(Error::InvalidProtocol);
        }
        Ok(())
    }

    fn command(&mut self, cmd: SocketCommand) -> Result<(), Error> {
        trace!("Socket {} command {:?}", self.index, cmd);
        self.net.issue(self.regs, cmd)
    }

    fn wait_closed(&mut self) -> Result<(), Error> {
        while self.status()? != SocketStatus::Closed {
            self.net.yield_now();
        }
        Ok(())
    }

    /// Program protocol, port and flags and issue OPEN
    ///
    /// The entry must be free. A hardware socket left open is closed first.
    pub fn open(&mut self, protocol: Protocol, port: u16, flags: SocketFlags) -> Result<(), Error> {
        if self.protocol().is_some() {
            return Err(Error::InvalidState);
        }
        if self.status()? != SocketStatus::Closed {
            self.command(SocketCommand::Close)?;
            self.wait_closed()?;
        }

        self.net
            .write_reg(self.regs.mr(), protocol as u8 | flags.bits())?;
        self.net.write_reg(self.regs.port(), port)?;
        self.command(SocketCommand::Open)?;

        let status = self.status()?;
        if status != protocol.initial_status() {
            warn!("Socket {} open rejected, status {:?}", self.index, status);
            self.command(SocketCommand::Close)?;
            return Err(Error::BindFailed);
        }

        let state = SocketState {
            protocol: Some(protocol),
            port,
            ..SocketState::new(self.index)
        };
        *self.state() = state;
        debug!("Socket {} open {:?} port {}", self.index, protocol, port);
        Ok(())
    }

    /// Put a TCP socket in server mode
    pub fn listen(&mut self) -> Result<(), Error> {
        self.expect_protocol(Protocol::Tcp)?;
        if self.status()? != SocketStatus::Init {
            return Err(Error::InvalidState);
        }
        self.command(SocketCommand::Listen)?;
        if self.status()? != SocketStatus::Listen {
            return Err(Error::HardwareFault);
        }
        Ok(())
    }

    /// Check a listening socket for an established connection
    pub fn accept(&mut self) -> Result<Accept, Error> {
        self.expect_protocol(Protocol::Tcp)?;
        match self.status()? {
            SocketStatus::Established => Ok(Accept::Established),
            SocketStatus::Listen | SocketStatus::SynRecv => Ok(Accept::Pending),
            SocketStatus::CloseWait => Err(Error::PeerClosed),
            _ => Err(Error::InvalidState),
        }
    }

    /// Start a TCP connection; completion shows up in [`is_connected`](Self::is_connected)
    pub fn connect(&mut self, addr: Ipv4Addr, port: u16) -> Result<(), Error> {
        self.expect_protocol(Protocol::Tcp)?;
        check_peer(addr)?;
        if port == 0 {
            return Err(Error::InvalidArgument);
        }
        if self.status()? != SocketStatus::Init {
            return Err(Error::InvalidState);
        }

        self.net.write_reg(self.regs.dipr(), addr)?;
        self.net.write_reg(self.regs.dport(), port)?;
        self.command(SocketCommand::Connect)?;

        match self.status()? {
            SocketStatus::Closed => Err(Error::HardwareFault),
            _ => Ok(()),
        }
    }

    /// Resolve `hostname` through the configured DNS server, then connect
    pub fn connect_host(&mut self, hostname: &str, port: u16) -> Result<(), Error> {
        self.expect_protocol(Protocol::Tcp)?;
        let addr = dns::resolve(&mut *self.net, hostname)?;
        self.connect(addr, port)
    }

    /// True once ESTABLISHED, false while the handshake is in progress
    pub fn is_connected(&mut self) -> Result<bool, Error> {
        self.expect_protocol(Protocol::Tcp)?;
        match self.status()? {
            SocketStatus::Established => Ok(true),
            SocketStatus::Init | SocketStatus::SynSent | SocketStatus::SynRecv => Ok(false),
            SocketStatus::CloseWait => Err(Error::PeerClosed),
            _ => Err(Error::InvalidState),
        }
    }

    /// Gracefully end a TCP connection and return the entry to the pool
    pub fn disconnect(&mut self) -> Result<(), Error> {
        self.expect_protocol(Protocol::Tcp)?;
        match self.status()? {
            SocketStatus::SynSent
            | SocketStatus::SynRecv
            | SocketStatus::Established
            | SocketStatus::CloseWait => {}
            _ => return Err(Error::InvalidState),
        }
        self.command(SocketCommand::Discon)?;
        self.wait_closed()?;
        self.release()
    }

    /// Close the socket and return the entry to the pool
    pub fn close(&mut self) -> Result<(), Error> {
        self.open_protocol()?;
        self.command(SocketCommand::Close)?;
        self.wait_closed()?;
        self.release()
    }

    fn release(&mut self) -> Result<(), Error> {
        self.net.write_reg(self.regs.ir(), 0xff)?;
        let state = SocketState::new(self.index);
        *self.state() = state;
        debug!("Socket {} closed", self.index);
        Ok(())
    }

    /// Bytes waiting in the RX window
    pub fn available(&mut self) -> Result<usize, Error> {
        Ok(self.net.read_reg(self.regs.rx_rsr())? as usize)
    }

    /// Free bytes in the TX window
    pub fn room(&mut self) -> Result<usize, Error> {
        Ok(self.net.read_reg(self.regs.tx_fsr())? as usize)
    }

    /// Set the destination of the next UDP or IP-raw message
    ///
    /// Anything still staged for the previous destination is sent first.
    pub fn datagram(&mut self, addr: Ipv4Addr, port: u16) -> Result<(), Error> {
        let protocol = self.open_protocol()?;
        if !matches!(protocol, Protocol::Udp | Protocol::IpRaw) {
            return Err(Error::InvalidProtocol);
        }
        // Broadcast destinations are valid for datagrams
        if addr.is_unspecified() || (protocol == Protocol::Udp && port == 0) {
            return Err(Error::InvalidArgument);
        }

        self.flush()?;
        self.net.write_reg(self.regs.dipr(), addr)?;
        self.net.write_reg(self.regs.dport(), port)?;
        self.setup()?;
        self.state().has_dest = true;
        Ok(())
    }

    /// Stage `buf` on an established TCP connection
    ///
    /// Full messages are sent as they fill up; call [`flush`](Self::flush)
    /// to send the remainder.
    pub fn send(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.expect_protocol(Protocol::Tcp)?;
        match self.status()? {
            SocketStatus::Established => {}
            SocketStatus::CloseWait => return Err(Error::PeerClosed),
            _ => return Err(Error::InvalidState),
        }
        self.write_message(buf)
    }

    /// Send `buf` as one datagram to `dest`
    pub fn send_to(&mut self, buf: &[u8], dest: SocketAddrV4) -> Result<usize, Error> {
        self.datagram(*dest.ip(), dest.port())?;
        self.write_message(buf)?;
        self.flush()?;
        Ok(buf.len())
    }

    /// Send the staged message and wait for the chip to report SEND_OK
    pub fn flush(&mut self) -> Result<(), Error> {
        let protocol = self.open_protocol()?;
        let len = self.state().tx_len;
        if len == 0 {
            return Ok(());
        }

        let ptr = self.net.read_reg(self.regs.tx_wr())?;
        self.net
            .write_reg(self.regs.tx_wr(), ptr.wrapping_add(len))?;
        self.state().tx_len = 0;

        let cmd = match protocol {
            Protocol::Udp => SocketCommand::SendMac,
            _ => SocketCommand::Send,
        };
        self.command(cmd)?;

        loop {
            let ir = Interrupt::from_bits_retain(self.net.read_reg(self.regs.ir())?);
            if ir.contains(Interrupt::SEND_OK) {
                return self
                    .net
                    .write_reg(self.regs.ir(), Interrupt::SEND_OK.bits());
            }
            if ir.contains(Interrupt::TIMEOUT) {
                self.net
                    .write_reg(self.regs.ir(), Interrupt::TIMEOUT.bits())?;
                warn!("Socket {} send timed out", self.index);
                return Err(match protocol {
                    Protocol::Tcp => Error::PeerClosed,
                    _ => Error::HardwareFault,
                });
            }
            if protocol == Protocol::Tcp && self.status()? == SocketStatus::Closed {
                return Err(Error::PeerClosed);
            }
            self.net.yield_now();
        }
    }

    /// Read from an established TCP connection; 0 when nothing is waiting
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.expect_protocol(Protocol::Tcp)?;
        let size = match self.status()? {
            SocketStatus::Established => self.available()?,
            SocketStatus::CloseWait => match self.available()? {
                0 => return Err(Error::PeerClosed),
                size => size,
            },
            _ => return Err(Error::InvalidState),
        };

        let len = buf.len().min(size);
        if len > 0 {
            self.read_window(&mut buf[..len])?;
        }
        Ok(len)
    }

    /// Receive one UDP or IP-raw datagram
    ///
    /// Returns `None` when nothing is waiting. A datagram longer than `buf`
    /// is truncated and the rest dropped.
    pub fn recv_from(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddrV4)>, Error> {
        let protocol = self.open_protocol()?;
        let header_len = match protocol {
            Protocol::Udp => UDP_HEADER,
            Protocol::IpRaw => IPRAW_HEADER,
            _ => return Err(Error::InvalidProtocol),
        };
        if self.available()? < header_len {
            return Ok(None);
        }

        let mut header = [0u8; UDP_HEADER];
        self.read_window(&mut header[..header_len])?;
        let addr = Ipv4Addr::new(header[0], header[1], header[2], header[3]);
        let (port, len) = match protocol {
            Protocol::Udp => (
                u16::from_be_bytes([header[4], header[5]]),
                u16::from_be_bytes([header[6], header[7]]),
            ),
            _ => (0, u16::from_be_bytes([header[4], header[5]])),
        };

        let n = self.read_payload(buf, len as usize)?;
        Ok(Some((n, SocketAddrV4::new(addr, port))))
    }

    /// Receive one MACRAW frame
    pub fn recv_frame(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
        self.expect_protocol(Protocol::MacRaw)?;
        if self.available()? < MACRAW_HEADER {
            return Ok(None);
        }
        let mut header = [0u8; MACRAW_HEADER];
        self.read_window(&mut header)?;
        // The length field counts itself
        let len = (u16::from_be_bytes(header) as usize).saturating_sub(MACRAW_HEADER);
        self.read_payload(buf, len).map(Some)
    }

    fn read_payload(&mut self, buf: &mut [u8], len: usize) -> Result<usize, Error> {
        let n = len.min(buf.len());
        if n > 0 {
            self.read_window(&mut buf[..n])?;
        }
        if n < len {
            self.skip(len - n)?;
        }
        Ok(n)
    }

    /// Wait until a whole message fits, then start a new one at the chip's write pointer
    fn setup(&mut self) -> Result<(), Error> {
        while self.room()? < MSG_MAX {
            self.net.yield_now();
        }
        let ptr = self.net.read_reg(self.regs.tx_wr())?;
        let state = self.state();
        state.tx_offset = ptr & BUF_MASK;
        state.tx_len = 0;
        Ok(())
    }

    fn write_message(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let mut rest = buf;
        while !rest.is_empty() {
            let n = self.write_window(rest)?;
            rest = &rest[n..];
            if self.state().tx_len as usize == MSG_MAX {
                self.flush()?;
            }
        }
        Ok(buf.len())
    }

    /// Copy as much of `buf` as fits in the current message into the TX window
    fn write_window(&mut self, buf: &[u8]) -> Result<usize, Error> {
        if self.state().tx_len == 0 {
            self.setup()?;
        }
        let SocketState {
            tx_base,
            tx_offset,
            tx_len,
            ..
        } = *self.state();
        let len = buf.len().min(MSG_MAX - tx_len as usize);
        let offset = tx_offset as usize;

        if offset + len > BUF_MAX {
            let head = BUF_MAX - offset;
            self.net.write_bytes(tx_base + tx_offset, &buf[..head])?;
            self.net.write_bytes(tx_base, &buf[head..len])?;
        } else {
            self.net.write_bytes(tx_base + tx_offset, &buf[..len])?;
        }

        let state = self.state();
        state.tx_offset = (tx_offset + len as u16) & BUF_MASK;
        state.tx_len += len as u16;
        Ok(len)
    }

    /// Read `buf.len()` bytes at the chip's read pointer and commit them
    fn read_window(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let ptr = self.net.read_reg(self.regs.rx_rd())?;
        let offset = ptr & BUF_MASK;
        let rx_base = self.state().rx_base;

        if offset as usize + buf.len() > BUF_MAX {
            let (head, tail) = buf.split_at_mut(BUF_MAX - offset as usize);
            self.net.read_bytes(rx_base + offset, head)?;
            self.net.read_bytes(rx_base, tail)?;
        } else {
            self.net.read_bytes(rx_base + offset, buf)?;
        }
        self.commit_read(ptr, buf.len())
    }

    fn skip(&mut self, len: usize) -> Result<(), Error> {
        let ptr = self.net.read_reg(self.regs.rx_rd())?;
        self.commit_read(ptr, len)
    }

    fn commit_read(&mut self, ptr: u16, len: usize) -> Result<(), Error> {
        self.net
            .write_reg(self.regs.rx_rd(), ptr.wrapping_add(len as u16))?;
        self.command(SocketCommand::Recv)
    }
}

impl<M, B, CS, D, const N: usize> embedded_io::ErrorType for Socket<'_, '_, M, B, CS, D, N>
where
    M: RawMutex,
{
    type Error = Error;
}

/// Blocking read: waits for data, returns 0 once a TCP peer has closed
impl<M, B, CS, D, const N: usize> embedded_io::Read for Socket<'_, '_, M, B, CS, D, N>
where
    M: RawMutex,
    B: SpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.open_protocol()? {
                Protocol::Tcp => match self.recv(buf) {
                    Ok(0) => {}
                    Ok(n) => return Ok(n),
                    Err(Error::PeerClosed) => return Ok(0),
                    Err(e) => return Err(e),
                },
                Protocol::Udp | Protocol::IpRaw => {
                    if let Some((n, _)) = self.recv_from(buf)? {
                        return Ok(n);
                    }
                }
                Protocol::MacRaw => {
                    if let Some(n) = self.recv_frame(buf)? {
                        return Ok(n);
                    }
                }
            }
            self.net.yield_now();
        }
    }
}

impl<M, B, CS, D, const N: usize> embedded_io::Write for Socket<'_, '_, M, B, CS, D, N>
where
    M: RawMutex,
    B: SpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        match self.open_protocol()? {
            Protocol::Tcp => self.send(buf),
            Protocol::Udp | Protocol::IpRaw if !self.net.sockets[self.index].has_dest => {
                Err(Error::InvalidState)
            }
            _ => self.write_message(buf),
        }
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Socket::flush(self)
    }
}

impl<M, B, CS, D, const N: usize> ByteStream for Socket<'_, '_, M, B, CS, D, N>
where
    M: RawMutex,
    B: SpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    fn available(&mut self) -> Result<usize, Self::Error> {
        Socket::available(self)
    }

    fn room(&mut self) -> Result<usize, Self::Error> {
        Socket::room(self)
    }
}
