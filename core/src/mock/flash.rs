//! NOR flash simulator: erase sets bytes to 0xFF, program only clears bits

use std::vec;
use std::vec::Vec;

use super::Peripheral;

pub struct FlashSim {
    pub mem: Vec<u8>,
    pub id: (u8, u8),
    /// Status polls that report BUSY after each program or erase
    pub busy_polls: u32,
    /// (address, length) of every accepted page program
    pub programs: Vec<(u32, usize)>,
    /// Set when a page program ran past the end of its page
    pub crossed_page: bool,
    /// (opcode, frame length) of every accepted erase
    pub erases: Vec<(u8, usize)>,
    frame: Vec<u8>,
    wel: bool,
    busy: u32,
}

impl FlashSim {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0xff; size],
            id: (0xef, 0x12),
            busy_polls: 0,
            programs: Vec::new(),
            crossed_page: false,
            erases: Vec::new(),
            frame: Vec::new(),
            wel: false,
            busy: 0,
        }
    }

    fn status(&self) -> u8 {
        let mut status = 0;
        if self.busy > 0 {
            status |= 0x01;
        }
        if self.wel {
            status |= 0x02;
        }
        status
    }

    fn address(&self) -> usize {
        let a = ((self.frame[1] as usize) << 16) | ((self.frame[2] as usize) << 8) | self.frame[3] as usize;
        a % self.mem.len()
    }

    fn erase(&mut self, block: usize) {
        let base = self.address() & !(block - 1);
        let end = (base + block).min(self.mem.len());
        self.mem[base..end].fill(0xff);
    }
}

impl Peripheral for FlashSim {
    fn select(&mut self) {
        self.frame.clear();
    }

    fn exchange(&mut self, byte: u8) -> u8 {
        self.frame.push(byte);
        let i = self.frame.len() - 1;
        match self.frame[0] {
            0x05 if i >= 1 => {
                let status = self.status();
                self.busy = self.busy.saturating_sub(1);
                status
            }
            0x90 if i == 4 => self.id.0,
            0x90 if i == 5 => self.id.1,
            0x03 if i >= 4 => {
                let a = (self.address() + i - 4) % self.mem.len();
                self.mem[a]
            }
            _ => 0,
        }
    }

    fn deselect(&mut self) {
        if self.frame.is_empty() {
            return;
        }
        match self.frame[0] {
            0x06 => self.wel = true,
            0x04 => self.wel = false,
            0x02 if self.wel && self.frame.len() > 4 => {
                let addr = self.address();
                let data = self.frame[4..].to_vec();
                if (addr & 0xff) + data.len() > 256 {
                    self.crossed_page = true;
                }
                let page = addr & !0xff;
                for (k, byte) in data.iter().enumerate() {
                    let a = page | ((addr + k) & 0xff);
                    self.mem[a] &= byte;
                }
                self.programs.push((addr as u32, data.len()));
                self.wel = false;
                self.busy = self.busy_polls;
            }
            op @ (0x20 | 0x52 | 0xd8) if self.wel && self.frame.len() >= 4 => {
                let block = match op {
                    0x20 => 4 * 1024,
                    0x52 => 32 * 1024,
                    _ => 64 * 1024,
                };
                self.erase(block);
                self.erases.push((op, self.frame.len()));
                self.wel = false;
                self.busy = self.busy_polls;
            }
            op @ (0xc7 | 0x60) if self.wel => {
                self.mem.fill(0xff);
                self.erases.push((op, self.frame.len()));
                self.wel = false;
                self.busy = self.busy_polls;
            }
            _ => {}
        }
    }
}
