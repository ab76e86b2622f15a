//! W5200 register map as typed register windows
//!
//! A [`Reg<T>`] is an address plus the value type stored there. Multi-byte
//! fields are big-endian on the chip; [`Register`] does the conversion so
//! callers never touch raw byte order.

use core::marker::PhantomData;
use core::net::Ipv4Addr;

use bitflags::bitflags;

/// Value that can live in a chip register
pub trait Register: Sized {
    /// Width in bytes
    const SIZE: usize;

    fn encode(&self, buf: &mut [u8]);
    fn decode(buf: &[u8]) -> Self;
}

impl Register for u8 {
    const SIZE: usize = 1;

    fn encode(&self, buf: &mut [u8]) {
        buf[0] = *self;
    }

    fn decode(buf: &[u8]) -> Self {
        buf[0]
    }
}

impl Register for u16 {
    const SIZE: usize = 2;

    fn encode(&self, buf: &mut [u8]) {
        buf[..2].copy_from_slice(&self.to_be_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        u16::from_be_bytes([buf[0], buf[1]])
    }
}

impl Register for Ipv4Addr {
    const SIZE: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.octets());
    }

    fn decode(buf: &[u8]) -> Self {
        Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3])
    }
}

impl Register for [u8; 6] {
    const SIZE: usize = 6;

    fn encode(&self, buf: &mut [u8]) {
        buf[..6].copy_from_slice(self);
    }

    fn decode(buf: &[u8]) -> Self {
        let mut mac = [0; 6];
        mac.copy_from_slice(&buf[..6]);
        mac
    }
}

/// Largest [`Register::SIZE`]
pub(crate) const REGISTER_MAX: usize = 6;

/// Typed register address
pub struct Reg<T> {
    addr: u16,
    _value: PhantomData<T>,
}

impl<T> Clone for Reg<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Reg<T> {}

impl<T: Register> Reg<T> {
    pub const fn at(addr: u16) -> Self {
        Self {
            addr,
            _value: PhantomData,
        }
    }

    pub const fn addr(&self) -> u16 {
        self.addr
    }
}

/// Common registers (datasheet ch. 3.1)
pub mod common {
    use super::Reg;
    use core::net::Ipv4Addr;

    pub const MR: Reg<u8> = Reg::at(0x0000);
    pub const GAR: Reg<Ipv4Addr> = Reg::at(0x0001);
    pub const SUBR: Reg<Ipv4Addr> = Reg::at(0x0005);
    pub const SHAR: Reg<[u8; 6]> = Reg::at(0x0009);
    pub const SIPR: Reg<Ipv4Addr> = Reg::at(0x000f);
    pub const IR: Reg<u8> = Reg::at(0x0015);
    pub const IMR: Reg<u8> = Reg::at(0x0016);
    /// Retry time in 100 µs units
    pub const RTR: Reg<u16> = Reg::at(0x0017);
    pub const RCR: Reg<u8> = Reg::at(0x0019);
    pub const VERSIONR: Reg<u8> = Reg::at(0x001f);
    pub const IR2: Reg<u8> = Reg::at(0x0034);
    pub const PSTATUS: Reg<u8> = Reg::at(0x0035);
    pub const IMR2: Reg<u8> = Reg::at(0x0036);
}

/// Chip version reported by VERSIONR
pub const VERSION: u8 = 0x03;

bitflags! {
    /// Common mode register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Mode: u8 {
        /// Software reset
        const RST = 0x80;
        /// Wake on LAN
        const WOL = 0x20;
        /// Ping block
        const PB = 0x10;
        const PPPOE = 0x08;
    }
}

pub const SOCKET_REGISTER_BASE: u16 = 0x4000;
pub const SOCKET_REGISTER_SIZE: u16 = 0x0100;
pub const TX_MEMORY_BASE: u16 = 0x8000;
pub const RX_MEMORY_BASE: u16 = 0xc000;

/// Hardware sockets on the chip
pub const SOCK_MAX: usize = 8;

/// Per-socket TX and RX window size
pub const BUF_MAX: usize = 2048;
pub const BUF_MASK: u16 = BUF_MAX as u16 - 1;

/// TXMEM_SIZE / RXMEM_SIZE value for a 2 KB window
pub const MEM_SIZE_2K: u8 = 0x02;

/// Register bank of one socket (datasheet ch. 3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketRegisters {
    base: u16,
}

impl SocketRegisters {
    pub const fn new(index: usize) -> Self {
        Self {
            base: SOCKET_REGISTER_BASE + index as u16 * SOCKET_REGISTER_SIZE,
        }
    }

    const fn reg<T: Register>(&self, offset: u16) -> Reg<T> {
        Reg::at(self.base + offset)
    }

    pub const fn mr(&self) -> Reg<u8> {
        self.reg(0x00)
    }

    pub const fn cr(&self) -> Reg<u8> {
        self.reg(0x01)
    }

    pub const fn ir(&self) -> Reg<u8> {
        self.reg(0x02)
    }

    pub const fn sr(&self) -> Reg<u8> {
        self.reg(0x03)
    }

    pub const fn port(&self) -> Reg<u16> {
        self.reg(0x04)
    }

    pub const fn dhar(&self) -> Reg<[u8; 6]> {
        self.reg(0x06)
    }

    pub const fn dipr(&self) -> Reg<Ipv4Addr> {
        self.reg(0x0c)
    }

    pub const fn dport(&self) -> Reg<u16> {
        self.reg(0x10)
    }

    pub const fn mssr(&self) -> Reg<u16> {
        self.reg(0x12)
    }

    pub const fn ttl(&self) -> Reg<u8> {
        self.reg(0x16)
    }

    pub const fn rxmem_size(&self) -> Reg<u8> {
        self.reg(0x1e)
    }

    pub const fn txmem_size(&self) -> Reg<u8> {
        self.reg(0x1f)
    }

    pub const fn tx_fsr(&self) -> Reg<u16> {
        self.reg(0x20)
    }

    pub const fn tx_rd(&self) -> Reg<u16> {
        self.reg(0x22)
    }

    pub const fn tx_wr(&self) -> Reg<u16> {
        self.reg(0x24)
    }

    pub const fn rx_rsr(&self) -> Reg<u16> {
        self.reg(0x26)
    }

    pub const fn rx_rd(&self) -> Reg<u16> {
        self.reg(0x28)
    }

    pub const fn rx_wr(&self) -> Reg<u16> {
        self.reg(0x2a)
    }

    pub const fn imr(&self) -> Reg<u8> {
        self.reg(0x2c)
    }
}

bitflags! {
    /// Socket mode register flag bits; the low nibble holds the protocol
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SocketFlags: u8 {
        /// UDP multicast
        const MULTI = 0x80;
        /// MACRAW MAC filter
        const MF = 0x40;
        /// TCP no delayed ACK; IGMP version in UDP multicast
        const ND = 0x20;
    }
}

/// Socket command register values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SocketCommand {
    Open = 0x01,
    Listen = 0x02,
    Connect = 0x04,
    Discon = 0x08,
    Close = 0x10,
    Send = 0x20,
    /// Send to the destination in DIPR/DPORT/DHAR
    SendMac = 0x21,
    SendKeep = 0x22,
    Recv = 0x40,
}

bitflags! {
    /// Socket interrupt register; bits are cleared by writing them back
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interrupt: u8 {
        const SEND_OK = 0x10;
        const TIMEOUT = 0x08;
        const RECV = 0x04;
        const DISCON = 0x02;
        const CON = 0x01;
    }
}

/// Socket status register, as maintained by the chip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SocketStatus {
    Closed,
    Arp,
    Init,
    Listen,
    SynSent,
    SynRecv,
    Established,
    FinWait,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
    Udp,
    IpRaw,
    MacRaw,
    Pppoe,
    Unknown(u8),
}

impl From<u8> for SocketStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Closed,
            0x01 => Self::Arp,
            0x13 => Self::Init,
            0x14 => Self::Listen,
            0x15 => Self::SynSent,
            0x16 => Self::SynRecv,
            0x17 => Self::Established,
            0x18 => Self::FinWait,
            0x1a => Self::Closing,
            0x1b => Self::TimeWait,
            0x1c => Self::CloseWait,
            0x1d => Self::LastAck,
            0x22 => Self::Udp,
            0x32 => Self::IpRaw,
            0x42 => Self::MacRaw,
            0x5f => Self::Pppoe,
            other => Self::Unknown(other),
        }
    }
}

/// SPI frame opcode, or'ed with the top bits of the length
pub(crate) const OP_WRITE: u8 = 0x80;
pub(crate) const OP_READ: u8 = 0x00;
