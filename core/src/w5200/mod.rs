//! WIZnet W5200 hardware TCP/IP offload controller
//!
//! The chip runs the protocol stack itself; this driver programs its
//! register file and polls status. [`W5200`] owns the common register bank
//! and a fixed pool of `N` sockets. A [`Socket`] is a short-lived borrow of
//! the controller plus a pool index, so all register traffic goes through the
//! controller's single [`BusDevice`].
//!
//! ## Memory layout
//!
//! | Region            | Address                     |
//! |-------------------|-----------------------------|
//! | Common registers  | `0x0000`                    |
//! | Socket `n` bank   | `0x4000 + n * 0x100`        |
//! | Socket `n` TX     | `0x8000 + n * 2048`         |
//! | Socket `n` RX     | `0xC000 + n * 2048`         |
//!
//! Each SPI frame is the 16-bit address, the opcode or'ed with the top of the
//! 15-bit length, the low length byte, then the payload.

pub mod dns;
pub mod registers;
mod socket;

pub use socket::{Accept, Socket};

use core::net::Ipv4Addr;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use hal_abstractions::DhcpClient;

use crate::bus::BusDevice;
use crate::config::NetworkConfig;
use crate::error::Error;
use registers::{
    common, Mode, Reg, Register, SocketCommand, SocketRegisters, BUF_MAX,
    MEM_SIZE_2K, OP_READ, OP_WRITE, REGISTER_MAX, RX_MEMORY_BASE, SOCK_MAX, TX_MEMORY_BASE,
    VERSION,
};

pub use registers::{SocketFlags, SocketStatus};

/// Pause between polls of a command or status register
const POLL_INTERVAL_US: u32 = 50;

/// Socket protocol, as written to the low nibble of Sn_MR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Protocol {
    Tcp = 0x01,
    Udp = 0x02,
    IpRaw = 0x03,
    MacRaw = 0x04,
}

impl Protocol {
    /// Status the chip reports once OPEN has completed
    pub fn initial_status(self) -> SocketStatus {
        match self {
            Self::Tcp => SocketStatus::Init,
            Self::Udp => SocketStatus::Udp,
            Self::IpRaw => SocketStatus::IpRaw,
            Self::MacRaw => SocketStatus::MacRaw,
        }
    }
}

/// Index of an allocated socket in the controller's pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SocketHandle(u8);

impl SocketHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Driver side bookkeeping for one pool entry
#[derive(Debug, Clone, Copy)]
struct SocketState {
    protocol: Option<Protocol>,
    port: u16,
    tx_base: u16,
    rx_base: u16,
    /// Next free offset in the TX window for the message being built
    tx_offset: u16,
    /// Bytes written to the TX window but not yet sent
    tx_len: u16,
    /// UDP/IP-raw destination programmed by `datagram`
    has_dest: bool,
}

impl SocketState {
    const fn new(index: usize) -> Self {
        Self {
            protocol: None,
            port: 0,
            tx_base: TX_MEMORY_BASE + (index * BUF_MAX) as u16,
            rx_base: RX_MEMORY_BASE + (index * BUF_MAX) as u16,
            tx_offset: 0,
            tx_len: 0,
            has_dest: false,
        }
    }
}

fn frame_header(addr: u16, op: u8, len: usize) -> [u8; 4] {
    let [addr_hi, addr_lo] = addr.to_be_bytes();
    [addr_hi, addr_lo, op | ((len >> 8) as u8 & 0x7f), len as u8]
}

/// W5200 driver owning a pool of `N` sockets
pub struct W5200<'a, M: RawMutex, B, CS, D, const N: usize = SOCK_MAX> {
    spi: BusDevice<'a, M, B, CS>,
    delay: D,
    config: NetworkConfig,
    sockets: [SocketState; N],
    next_port: u16,
    dns: Ipv4Addr,
    dns_id: u16,
}

impl<'a, M, B, CS, D, const N: usize> W5200<'a, M, B, CS, D, N>
where
    M: RawMutex,
    B: SpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    const POOL_FITS: () = assert!(N > 0 && N <= SOCK_MAX, "W5200 has at most 8 sockets");

    pub fn new(spi: BusDevice<'a, M, B, CS>, delay: D, config: NetworkConfig) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::POOL_FITS;
        let mut sockets = [SocketState::new(0); N];
        for (index, state) in sockets.iter_mut().enumerate() {
            *state = SocketState::new(index);
        }
        Self {
            spi,
            delay,
            next_port: config.dynamic_port,
            config,
            sockets,
            dns: Ipv4Addr::UNSPECIFIED,
            dns_id: 0,
        }
    }

    /// Reset the chip and program a static address
    ///
    /// `None` leaves the address or subnet at 0.0.0.0. `timeout_ms` sets the
    /// hardware retransmission timeout.
    pub fn begin(
        &mut self,
        ip: Option<Ipv4Addr>,
        subnet: Option<Ipv4Addr>,
        timeout_ms: u16,
    ) -> Result<(), Error> {
        for (index, state) in self.sockets.iter_mut().enumerate() {
            *state = SocketState::new(index);
        }

        self.write_reg(common::MR, Mode::RST.bits())?;
        while Mode::from_bits_retain(self.read_reg(common::MR)?).contains(Mode::RST) {
            self.delay.delay_us(POLL_INTERVAL_US);
        }

        let version = self.read_reg(common::VERSIONR)?;
        if version != VERSION {
            warn!("Unexpected W5200 version {:02x}", version);
            return Err(Error::IdentificationMismatch);
        }

        self.write_reg(common::SHAR, self.config.mac_addr)?;
        self.bind(
            ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
            subnet.unwrap_or(Ipv4Addr::UNSPECIFIED),
            None,
        )?;
        self.write_reg(common::RTR, timeout_ms.saturating_mul(10))?;
        self.write_reg(common::RCR, self.config.retry_count)?;

        // 16 KB of buffer memory each way; unused hardware sockets get none
        for index in 0..SOCK_MAX {
            let size = if index < N { MEM_SIZE_2K } else { 0 };
            let regs = SocketRegisters::new(index);
            self.write_reg(regs.txmem_size(), size)?;
            self.write_reg(regs.rxmem_size(), size)?;
        }

        let mac = self.config.mac_addr;
        info!(
            "W5200 ready: {} sockets, MAC {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            N, mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
        );
        Ok(())
    }

    /// Reset the chip and take address, subnet, gateway and DNS server from DHCP
    pub fn begin_dhcp<H>(&mut self, hostname: &str, dhcp: &mut H, timeout_ms: u16) -> Result<(), Error>
    where
        H: DhcpClient<Self>,
    {
        self.begin(None, None, timeout_ms)?;

        let mac = self.config.mac_addr;
        let lease = dhcp.lease(self, hostname, mac, timeout_ms).map_err(|_| {
            warn!("DHCP lease for {} failed", hostname);
            Error::DhcpFailed
        })?;

        self.bind(lease.ip, lease.subnet, Some(lease.gateway))?;
        self.dns = lease.dns;
        let ip = lease.ip.octets();
        info!("DHCP lease {}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]);
        Ok(())
    }

    /// Program address, subnet and gateway; the gateway defaults to x.y.z.1
    pub fn bind(
        &mut self,
        ip: Ipv4Addr,
        subnet: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
    ) -> Result<(), Error> {
        let gateway = gateway.unwrap_or_else(|| {
            if ip.is_unspecified() {
                ip
            } else {
                let [a, b, c, _] = ip.octets();
                Ipv4Addr::new(a, b, c, 1)
            }
        });
        self.write_reg(common::SIPR, ip)?;
        self.write_reg(common::SUBR, subnet)?;
        self.write_reg(common::GAR, gateway)
    }

    /// Current network address and subnet mask
    pub fn addr(&mut self) -> Result<(Ipv4Addr, Ipv4Addr), Error> {
        Ok((self.read_reg(common::SIPR)?, self.read_reg(common::SUBR)?))
    }

    pub fn mac_addr(&self) -> [u8; 6] {
        self.config.mac_addr
    }

    /// DNS server used for hostname resolution
    pub fn dns_addr(&self) -> Ipv4Addr {
        self.dns
    }

    pub fn set_dns_addr(&mut self, dns: Ipv4Addr) {
        self.dns = dns;
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Open the first free pool entry
    ///
    /// Port 0 picks the next dynamic port. Fails with
    /// [`Error::BindFailed`] when every socket is in use or the chip does
    /// not reach the protocol's initial state.
    pub fn socket(
        &mut self,
        protocol: Protocol,
        port: u16,
        flags: SocketFlags,
    ) -> Result<SocketHandle, Error> {
        let Some(index) = self.sockets.iter().position(|s| s.protocol.is_none()) else {
            warn!("Socket pool exhausted");
            return Err(Error::BindFailed);
        };
        let port = if port == 0 { self.next_port() } else { port };
        let handle = SocketHandle(index as u8);
        self.get(handle).open(protocol, port, flags)?;
        Ok(handle)
    }

    /// Borrow a pool entry for socket operations
    pub fn get(&mut self, handle: SocketHandle) -> Socket<'_, 'a, M, B, CS, D, N> {
        Socket::new(self, handle.index())
    }

    /// Number of pool entries currently open
    pub fn sockets_in_use(&self) -> usize {
        self.sockets.iter().filter(|s| s.protocol.is_some()).count()
    }

    /// Close every open socket
    pub fn end(&mut self) -> Result<(), Error> {
        for index in 0..N {
            if self.sockets[index].protocol.is_some() {
                self.get(SocketHandle(index as u8)).close()?;
            }
        }
        Ok(())
    }

    fn next_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = match port {
            u16::MAX => self.config.dynamic_port,
            _ => port + 1,
        };
        port
    }

    fn next_dns_id(&mut self) -> u16 {
        self.dns_id = self.dns_id.wrapping_add(1);
        self.dns_id
    }

    fn write_bytes(&mut self, addr: u16, buf: &[u8]) -> Result<(), Error> {
        let header = frame_header(addr, OP_WRITE, buf.len());
        self.spi.acquire(|bus| {
            bus.begin()?;
            bus.write(&header)?;
            bus.write(buf)?;
            bus.end()
        })
    }

    fn read_bytes(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), Error> {
        let header = frame_header(addr, OP_READ, buf.len());
        self.spi.acquire(|bus| {
            bus.begin()?;
            bus.write(&header)?;
            bus.read(buf)?;
            bus.end()
        })
    }

    fn read_reg<T: Register>(&mut self, reg: Reg<T>) -> Result<T, Error> {
        let mut buf = [0u8; REGISTER_MAX];
        self.read_bytes(reg.addr(), &mut buf[..T::SIZE])?;
        Ok(T::decode(&buf[..T::SIZE]))
    }

    fn write_reg<T: Register>(&mut self, reg: Reg<T>, value: T) -> Result<(), Error> {
        let mut buf = [0u8; REGISTER_MAX];
        value.encode(&mut buf[..T::SIZE]);
        self.write_bytes(reg.addr(), &buf[..T::SIZE])
    }

    /// Write a socket command and wait for the chip to accept it
    fn issue(&mut self, regs: SocketRegisters, cmd: SocketCommand) -> Result<(), Error> {
        self.write_reg(regs.cr(), cmd as u8)?;
        while self.read_reg(regs.cr())? != 0 {
            self.delay.delay_us(POLL_INTERVAL_US);
        }
        Ok(())
    }

    fn yield_now(&mut self) {
        self.delay.delay_us(POLL_INTERVAL_US);
    }
}
