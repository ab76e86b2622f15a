//! Shared SPI bus arbitration
//!
//! A single [`BusArbiter`] owns the SPI bus. Every peripheral driver holds a
//! [`BusDevice`], its chip-select pin bound to the arbiter. Bus ownership is
//! scoped: [`BusDevice::acquire`] runs a closure with a [`Transaction`] and
//! releases the bus when the closure returns, on the error path too.
//!
//! The arbiter is generic over the embassy-sync `RawMutex`, so a board can
//! share it with `CriticalSectionRawMutex` while host tests use
//! `NoopRawMutex`.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

use crate::error::Error;

/// Owner of the shared SPI bus
pub struct BusArbiter<M: RawMutex, B> {
    bus: Mutex<M, RefCell<B>>,
}

impl<M: RawMutex, B: SpiBus> BusArbiter<M, B> {
    /// Take ownership of the SPI bus
    pub const fn new(bus: B) -> Self {
        Self {
            bus: Mutex::new(RefCell::new(bus)),
        }
    }

    fn with_bus<R>(&self, f: impl FnOnce(&mut B) -> Result<R, Error>) -> Result<R, Error> {
        self.bus.lock(|cell| {
            // A second borrow means some driver acquired from inside its own transaction
            let mut bus = cell.try_borrow_mut().map_err(|_| {
                error!("SPI bus acquired while already owned");
                Error::BusBusy
            })?;
            f(&mut bus)
        })
    }
}

/// A chip-select line bound to a [`BusArbiter`]
pub struct BusDevice<'a, M: RawMutex, B, CS> {
    arbiter: &'a BusArbiter<M, B>,
    cs: CS,
}

impl<'a, M: RawMutex, B: SpiBus, CS: OutputPin> BusDevice<'a, M, B, CS> {
    /// Bind `cs` to the arbiter, leaving the device deselected
    pub fn new(arbiter: &'a BusArbiter<M, B>, mut cs: CS) -> Result<Self, Error> {
        cs.set_high().map_err(|_| Error::Transport)?;
        Ok(Self { arbiter, cs })
    }

    /// Own the bus for the duration of `f`
    ///
    /// Chip-select is deasserted and the bus flushed before returning, even
    /// when `f` fails. Calling `acquire` on any device from inside `f`
    /// returns [`Error::BusBusy`].
    pub fn acquire<R, F>(&mut self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut Transaction<'_, B, CS>) -> Result<R, Error>,
    {
        let cs = &mut self.cs;
        self.arbiter.with_bus(move |bus| {
            let mut tx = Transaction {
                bus,
                cs,
                selected: false,
            };
            let result = f(&mut tx);
            let released = tx.release();
            let value = result?;
            released?;
            Ok(value)
        })
    }
}

/// Exclusive bus ownership window for one device
pub struct Transaction<'t, B, CS: OutputPin> {
    bus: &'t mut B,
    cs: &'t mut CS,
    selected: bool,
}

impl<B: SpiBus, CS: OutputPin> Transaction<'_, B, CS> {
    /// Assert chip-select
    pub fn begin(&mut self) -> Result<(), Error> {
        self.cs.set_low().map_err(|_| Error::Transport)?;
        self.selected = true;
        Ok(())
    }

    /// Wait for the bus to drain, then deassert chip-select
    pub fn end(&mut self) -> Result<(), Error> {
        if !self.selected {
            return Ok(());
        }
        self.selected = false;
        let flushed = self.bus.flush().map_err(|_| Error::Transport);
        self.cs.set_high().map_err(|_| Error::Transport)?;
        flushed
    }

    /// Exchange one byte
    pub fn transfer(&mut self, byte: u8) -> Result<u8, Error> {
        let mut buf = [byte];
        self.bus
            .transfer_in_place(&mut buf)
            .map_err(|_| Error::Transport)?;
        Ok(buf[0])
    }

    /// Clock in `buf.len()` bytes
    pub fn read(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.bus.read(buf).map_err(|_| Error::Transport)
    }

    /// Clock out `buf`, discarding what comes back
    pub fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.bus.write(buf).map_err(|_| Error::Transport)
    }

    fn release(&mut self) -> Result<(), Error> {
        self.end()?;
        self.bus.flush().map_err(|_| Error::Transport)
    }
}

impl<B, CS: OutputPin> Drop for Transaction<'_, B, CS> {
    fn drop(&mut self) {
        if self.selected {
            let _ = self.cs.set_high();
        }
    }
}
