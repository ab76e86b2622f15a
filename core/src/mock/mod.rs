//! Test doubles for the SPI wire and the two peripherals
//!
//! A [`Wire`] routes bytes from one [`MockBus`] to whichever attached
//! peripheral currently has its [`MockPin`] low, and records selection
//! overlaps so tests can assert that no two devices ever talk at once.

mod flash;
mod w5200;

pub use flash::FlashSim;
pub use w5200::{Sent, W5200Sim};

use core::convert::Infallible;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::vec::Vec;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{self, OutputPin};
use embedded_hal::spi::{self, SpiBus};

use crate::bus::{BusArbiter, BusDevice};
use crate::config::NetworkConfig;
use crate::w5200::W5200;

/// A chip-selected device on the mock wire
pub trait Peripheral {
    fn select(&mut self);
    fn exchange(&mut self, byte: u8) -> u8;
    fn deselect(&mut self);
}

struct WireState {
    devices: Vec<Rc<RefCell<dyn Peripheral>>>,
    selected: Option<usize>,
    overlapped: bool,
    transactions: usize,
}

#[derive(Clone)]
pub struct Wire(Rc<RefCell<WireState>>);

impl Wire {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(WireState {
            devices: Vec::new(),
            selected: None,
            overlapped: false,
            transactions: 0,
        })))
    }

    /// Connect a peripheral and hand back its chip-select pin
    pub fn attach<P: Peripheral + 'static>(&self, device: Rc<RefCell<P>>) -> MockPin {
        let mut state = self.0.borrow_mut();
        state.devices.push(device);
        MockPin {
            wire: self.clone(),
            id: state.devices.len() - 1,
        }
    }

    pub fn bus(&self) -> MockBus {
        MockBus(self.clone())
    }

    pub fn selected(&self) -> Option<usize> {
        self.0.borrow().selected
    }

    pub fn overlapped(&self) -> bool {
        self.0.borrow().overlapped
    }

    pub fn transactions(&self) -> usize {
        self.0.borrow().transactions
    }

    fn exchange(&self, byte: u8) -> u8 {
        let device = {
            let state = self.0.borrow();
            match state.selected {
                Some(id) => state.devices[id].clone(),
                None => return 0xff,
            }
        };
        let response = device.borrow_mut().exchange(byte);
        response
    }
}

pub struct MockPin {
    wire: Wire,
    id: usize,
}

impl digital::ErrorType for MockPin {
    type Error = Infallible;
}

impl OutputPin for MockPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        let device = {
            let mut state = self.wire.0.borrow_mut();
            match state.selected {
                Some(id) if id == self.id => return Ok(()),
                Some(_) => state.overlapped = true,
                None => {}
            }
            state.selected = Some(self.id);
            state.transactions += 1;
            state.devices[self.id].clone()
        };
        device.borrow_mut().select();
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        let device = {
            let mut state = self.wire.0.borrow_mut();
            if state.selected != Some(self.id) {
                return Ok(());
            }
            state.selected = None;
            state.devices[self.id].clone()
        };
        device.borrow_mut().deselect();
        Ok(())
    }
}

pub struct MockBus(Wire);

impl spi::ErrorType for MockBus {
    type Error = Infallible;
}

impl SpiBus for MockBus {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        for word in words.iter_mut() {
            *word = self.0.exchange(0);
        }
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        for word in words {
            self.0.exchange(*word);
        }
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        for i in 0..read.len().max(write.len()) {
            let response = self.0.exchange(write.get(i).copied().unwrap_or(0));
            if let Some(slot) = read.get_mut(i) {
                *slot = response;
            }
        }
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        for word in words.iter_mut() {
            *word = self.0.exchange(*word);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Delay that only counts how often it was asked to yield
#[derive(Clone, Default)]
pub struct MockDelay {
    calls: Rc<Cell<usize>>,
}

impl MockDelay {
    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    fn tick(&mut self) {
        self.calls.set(self.calls.get() + 1);
    }
}

impl DelayNs for MockDelay {
    fn delay_ns(&mut self, _ns: u32) {
        self.tick();
    }

    fn delay_us(&mut self, _us: u32) {
        self.tick();
    }

    fn delay_ms(&mut self, _ms: u32) {
        self.tick();
    }
}

/// Controller wired to a [`W5200Sim`] on the mock bus
pub type TestNet<'a, const N: usize> = W5200<'a, NoopRawMutex, MockBus, MockPin, MockDelay, N>;

pub fn controller<'a, const N: usize>(
    arbiter: &'a BusArbiter<NoopRawMutex, MockBus>,
    wire: &Wire,
    sim: &Rc<RefCell<W5200Sim>>,
    delay: MockDelay,
) -> TestNet<'a, N> {
    let cs = wire.attach(sim.clone());
    let spi = BusDevice::new(arbiter, cs).unwrap();
    W5200::new(spi, delay, NetworkConfig::default())
}
