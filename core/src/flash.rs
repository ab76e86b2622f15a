//! Winbond W25X40CL serial NOR flash driver
//!
//! 4 Mbit device organised as 256 byte pages, 4 KB sectors and 32/64 KB
//! blocks. Programming never crosses a page boundary within one bus
//! transaction; [`PageChunks`] does the splitting. Program and erase poll the
//! status register until BUSY clears, yielding through the delay between
//! polls. There is no timeout on that poll.

use bitflags::bitflags;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

use crate::bus::BusDevice;
use crate::error::Error;

/// Program page size in bytes
pub const PAGE_MAX: usize = 256;
const PAGE_MASK: u32 = PAGE_MAX as u32 - 1;

/// Manufacturer and device id returned by [`Command::DeviceId`]
pub const MANUFACTURER: u8 = 0xef;
pub const DEVICE: u8 = 0x12;

/// Pause between status polls while the device is busy
const POLL_INTERVAL_US: u32 = 100;

/// Instruction set (datasheet ch. 8.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Command {
    WriteEnable = 0x06,
    WriteDisable = 0x04,
    ReadStatus = 0x05,
    WriteStatus = 0x01,
    Read = 0x03,
    FastRead = 0x0b,
    PageProgram = 0x02,
    SectorErase = 0x20,
    Block32Erase = 0x52,
    Block64Erase = 0xd8,
    ChipErase = 0xc7,
    PowerDown = 0xb9,
    ReleasePowerDown = 0xab,
    DeviceId = 0x90,
    JedecId = 0x9f,
}

bitflags! {
    /// Status register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u8 {
        /// Erase or write in progress
        const BUSY = 0x01;
        /// Write enable latch
        const WEL = 0x02;
        const BP0 = 0x04;
        const BP1 = 0x08;
        const BP2 = 0x10;
        /// Top/bottom protect
        const TB = 0x20;
        /// Status register protect
        const SRP = 0x80;
    }
}

/// Erase granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EraseSize {
    /// 4 KB sector
    Sector,
    /// 32 KB block
    Block32,
    /// 64 KB block
    Block64,
    /// Whole device
    Chip,
}

impl EraseSize {
    fn command(self) -> Command {
        match self {
            Self::Sector => Command::SectorErase,
            Self::Block32 => Command::Block32Erase,
            Self::Block64 => Command::Block64Erase,
            Self::Chip => Command::ChipErase,
        }
    }
}

/// Legacy size codes: kilobytes, with 255 meaning the whole chip
impl TryFrom<u8> for EraseSize {
    type Error = Error;

    fn try_from(size: u8) -> Result<Self, Error> {
        match size {
            4 => Ok(Self::Sector),
            32 => Ok(Self::Block32),
            64 => Ok(Self::Block64),
            255 => Ok(Self::Chip),
            _ => Err(Error::InvalidArgument),
        }
    }
}

/// One page-bounded slice of a program request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Flash address of the first byte
    pub addr: u32,
    /// Offset into the source buffer
    pub offset: usize,
    pub len: usize,
}

/// Splits `len` bytes at `addr` into chunks that never cross a page
pub struct PageChunks {
    addr: u32,
    offset: usize,
    remaining: usize,
}

impl PageChunks {
    pub fn new(addr: u32, len: usize) -> Self {
        Self {
            addr,
            offset: 0,
            remaining: len,
        }
    }
}

impl Iterator for PageChunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.remaining == 0 {
            return None;
        }
        let room = PAGE_MAX - (self.addr & PAGE_MASK) as usize;
        let chunk = Chunk {
            addr: self.addr,
            offset: self.offset,
            len: room.min(self.remaining),
        };
        self.addr = self.addr.wrapping_add(chunk.len as u32);
        self.offset += chunk.len;
        self.remaining -= chunk.len;
        Some(chunk)
    }
}

/// 24-bit big-endian address frame
fn address(addr: u32) -> [u8; 3] {
    let [_, hi, mid, lo] = addr.to_be_bytes();
    [hi, mid, lo]
}

/// W25X40CL driver on a shared SPI bus
pub struct W25x40cl<'a, M: RawMutex, B, CS, D> {
    spi: BusDevice<'a, M, B, CS>,
    delay: D,
    status: Status,
}

impl<'a, M, B, CS, D> W25x40cl<'a, M, B, CS, D>
where
    M: RawMutex,
    B: SpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    pub fn new(spi: BusDevice<'a, M, B, CS>, delay: D) -> Self {
        Self {
            spi,
            delay,
            status: Status::empty(),
        }
    }

    /// Wait for the device to go idle and check its identification
    pub fn begin(&mut self) -> Result<(), Error> {
        self.wait_ready()?;

        let (manufacturer, device) = self.spi.acquire(|bus| {
            bus.begin()?;
            bus.write(&[Command::DeviceId as u8, 0, 0, 0])?;
            let manufacturer = bus.transfer(0)?;
            let device = bus.transfer(0)?;
            bus.end()?;
            Ok((manufacturer, device))
        })?;

        if manufacturer != MANUFACTURER || device != DEVICE {
            warn!(
                "Flash identification mismatch: {:02x}:{:02x}",
                manufacturer, device
            );
            return Err(Error::IdentificationMismatch);
        }
        info!("W25X40CL flash detected");
        Ok(())
    }

    /// Read the status register; true when no erase or program is running
    pub fn is_ready(&mut self) -> Result<bool, Error> {
        let status = self.issue(Command::ReadStatus)?;
        self.status = Status::from_bits_retain(status);
        Ok(!self.status.contains(Status::BUSY))
    }

    /// Status register as of the last [`is_ready`](Self::is_ready) poll
    pub fn status(&self) -> Status {
        self.status
    }

    /// Read `dest.len()` bytes starting at `src`; may span pages
    pub fn read(&mut self, src: u32, dest: &mut [u8]) -> Result<usize, Error> {
        self.spi.acquire(|bus| {
            bus.begin()?;
            bus.transfer(Command::Read as u8)?;
            bus.write(&address(src))?;
            bus.read(dest)?;
            bus.end()
        })?;
        Ok(dest.len())
    }

    /// Program `src` at `dest`, one page-bounded chunk per transaction
    ///
    /// The target region must have been erased; programming only clears
    /// bits.
    pub fn write(&mut self, dest: u32, src: &[u8]) -> Result<usize, Error> {
        for chunk in PageChunks::new(dest, src.len()) {
            let data = &src[chunk.offset..chunk.offset + chunk.len];
            trace!("Program {} bytes at {:06x}", chunk.len, chunk.addr);
            self.spi.acquire(|bus| {
                bus.begin()?;
                bus.transfer(Command::WriteEnable as u8)?;
                bus.end()?;
                bus.begin()?;
                bus.transfer(Command::PageProgram as u8)?;
                bus.write(&address(chunk.addr))?;
                bus.write(data)?;
                bus.end()
            })?;
            self.wait_ready()?;
        }
        Ok(src.len())
    }

    /// Program a constant table, e.g. one placed in read-only memory
    pub fn write_static(&mut self, dest: u32, src: &'static [u8]) -> Result<usize, Error> {
        self.write(dest, src)
    }

    /// Erase the sector, block or chip containing `addr`
    pub fn erase(&mut self, addr: u32, size: EraseSize) -> Result<(), Error> {
        debug!("Erase {:?} at {:06x}", size, addr);
        self.spi.acquire(|bus| {
            bus.begin()?;
            bus.transfer(Command::WriteEnable as u8)?;
            bus.end()?;
            bus.begin()?;
            bus.transfer(size.command() as u8)?;
            if size != EraseSize::Chip {
                bus.write(&address(addr))?;
            }
            bus.end()
        })?;
        self.wait_ready()
    }

    /// Send a single command byte and return the byte clocked in after it
    pub fn issue(&mut self, cmd: Command) -> Result<u8, Error> {
        self.spi.acquire(|bus| {
            bus.begin()?;
            bus.transfer(cmd as u8)?;
            let response = bus.transfer(0)?;
            bus.end()?;
            Ok(response)
        })
    }

    fn wait_ready(&mut self) -> Result<(), Error> {
        while !self.is_ready()? {
            self.delay.delay_us(POLL_INTERVAL_US);
        }
        Ok(())
    }
}
