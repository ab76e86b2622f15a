//! Register-level W5200 model
//!
//! Decodes SPI frames, applies writes when chip-select is released, and
//! executes socket commands the moment CR is written. Free-size and
//! received-size registers are derived from the ring pointers.

use core::net::{Ipv4Addr, SocketAddrV4};
use std::boxed::Box;
use std::vec::Vec;

use super::Peripheral;

const MEM_SIZE: usize = 0x10000;
const WINDOW: u16 = 2048;
const MASK: u16 = WINDOW - 1;

const SOCKET_BASE: u16 = 0x4000;
const SOCKET_END: u16 = 0x4800;

const SN_MR: u16 = 0x00;
const SN_CR: u16 = 0x01;
const SN_IR: u16 = 0x02;
const SN_SR: u16 = 0x03;
const SN_DIPR: u16 = 0x0c;
const SN_DPORT: u16 = 0x10;
const SN_TX_FSR: u16 = 0x20;
const SN_TX_RD: u16 = 0x22;
const SN_TX_WR: u16 = 0x24;
const SN_RX_RSR: u16 = 0x26;
const SN_RX_RD: u16 = 0x28;
const SN_RX_WR: u16 = 0x2a;

/// A message the chip was told to transmit
#[derive(Debug, Clone)]
pub struct Sent {
    pub socket: usize,
    pub command: u8,
    pub dest: SocketAddrV4,
    pub data: Vec<u8>,
}

/// Builds the reply datagram, if any, for a transmitted message
pub type Responder = Box<dyn FnMut(&Sent) -> Option<Vec<u8>>>;

pub struct W5200Sim {
    pub mem: Vec<u8>,
    pub sent: Vec<Sent>,
    /// Leave the status CLOSED on OPEN
    pub reject_open: bool,
    /// Ring pointer value after OPEN
    pub pointer_base: u16,
    pub responder: Option<Responder>,
    /// Every socket command in issue order
    pub commands: Vec<(usize, u8)>,
    /// Commands accepted without changing any state
    pub ignored: Vec<u8>,
    /// Report TIMEOUT instead of SEND_OK after a send
    pub send_timeout: bool,
    frame: Vec<u8>,
}

impl W5200Sim {
    pub fn new() -> Self {
        let mut mem = std::vec![0; MEM_SIZE];
        mem[0x1f] = 0x03;
        Self {
            mem,
            sent: Vec::new(),
            reject_open: false,
            pointer_base: 0,
            responder: None,
            commands: Vec::new(),
            ignored: Vec::new(),
            send_timeout: false,
            frame: Vec::new(),
        }
    }

    fn reg(n: usize, offset: u16) -> usize {
        (SOCKET_BASE + n as u16 * 0x100 + offset) as usize
    }

    fn get16(&self, n: usize, offset: u16) -> u16 {
        let addr = Self::reg(n, offset);
        u16::from_be_bytes([self.mem[addr], self.mem[addr + 1]])
    }

    fn set16(&mut self, n: usize, offset: u16, value: u16) {
        let addr = Self::reg(n, offset);
        self.mem[addr..addr + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn tx_base(n: usize) -> usize {
        0x8000 + n * WINDOW as usize
    }

    fn rx_base(n: usize) -> usize {
        0xc000 + n * WINDOW as usize
    }

    pub fn status(&self, n: usize) -> u8 {
        self.mem[Self::reg(n, SN_SR)]
    }

    pub fn set_status(&mut self, n: usize, status: u8) {
        self.mem[Self::reg(n, SN_SR)] = status;
    }

    /// Destination programmed in DIPR/DPORT
    pub fn dest(&self, n: usize) -> SocketAddrV4 {
        let ip = Self::reg(n, SN_DIPR);
        let addr = Ipv4Addr::new(
            self.mem[ip],
            self.mem[ip + 1],
            self.mem[ip + 2],
            self.mem[ip + 3],
        );
        SocketAddrV4::new(addr, self.get16(n, SN_DPORT))
    }

    pub fn tx_wr(&self, n: usize) -> u16 {
        self.get16(n, SN_TX_WR)
    }

    /// Append raw bytes to socket `n`'s RX ring
    pub fn inject(&mut self, n: usize, data: &[u8]) {
        let mut wr = self.get16(n, SN_RX_WR);
        for &byte in data {
            self.mem[Self::rx_base(n) + (wr & MASK) as usize] = byte;
            wr = wr.wrapping_add(1);
        }
        self.set16(n, SN_RX_WR, wr);
    }

    /// Append a datagram with the chip's 8-byte UDP header
    pub fn inject_udp(&mut self, n: usize, from: SocketAddrV4, data: &[u8]) {
        let mut header = [0u8; 8];
        header[..4].copy_from_slice(&from.ip().octets());
        header[4..6].copy_from_slice(&from.port().to_be_bytes());
        header[6..].copy_from_slice(&(data.len() as u16).to_be_bytes());
        self.inject(n, &header);
        self.inject(n, data);
    }

    /// Append an IP-raw packet with the chip's 6-byte header
    pub fn inject_ipraw(&mut self, n: usize, from: Ipv4Addr, data: &[u8]) {
        let mut header = [0u8; 6];
        header[..4].copy_from_slice(&from.octets());
        header[4..].copy_from_slice(&(data.len() as u16).to_be_bytes());
        self.inject(n, &header);
        self.inject(n, data);
    }

    /// Append a MACRAW frame; the length field counts itself
    pub fn inject_frame(&mut self, n: usize, frame: &[u8]) {
        self.inject(n, &(frame.len() as u16 + 2).to_be_bytes());
        self.inject(n, frame);
    }

    fn header(&self) -> (u16, bool, usize) {
        let addr = u16::from_be_bytes([self.frame[0], self.frame[1]]);
        let write = self.frame[2] & 0x80 != 0;
        let len = (((self.frame[2] & 0x7f) as usize) << 8) | self.frame[3] as usize;
        (addr, write, len)
    }

    fn socket_of(addr: u16) -> Option<(usize, u16)> {
        (SOCKET_BASE..SOCKET_END)
            .contains(&addr)
            .then(|| (((addr - SOCKET_BASE) >> 8) as usize, addr & 0xff))
    }

    fn load(&self, addr: u16) -> u8 {
        let derived = match Self::socket_of(addr) {
            Some((n, off @ (SN_TX_FSR | 0x21))) => {
                let used = self.get16(n, SN_TX_WR).wrapping_sub(self.get16(n, SN_TX_RD));
                Some((WINDOW - used, off - SN_TX_FSR))
            }
            Some((n, off @ (SN_RX_RSR | 0x27))) => {
                let size = self.get16(n, SN_RX_WR).wrapping_sub(self.get16(n, SN_RX_RD));
                Some((size, off - SN_RX_RSR))
            }
            _ => None,
        };
        match derived {
            Some((value, byte)) => value.to_be_bytes()[byte as usize],
            None => self.mem[addr as usize],
        }
    }

    fn store(&mut self, addr: u16, value: u8) {
        match Self::socket_of(addr) {
            Some((n, SN_CR)) => self.execute(n, value),
            // Interrupt bits clear when written as one
            Some((_, SN_IR)) => self.mem[addr as usize] &= !value,
            None if addr == 0 => self.mem[0] = value & !0x80,
            _ => self.mem[addr as usize] = value,
        }
    }

    fn execute(&mut self, n: usize, cmd: u8) {
        self.commands.push((n, cmd));
        if self.ignored.contains(&cmd) {
            return;
        }
        match cmd {
            0x01 => {
                let status = match self.mem[Self::reg(n, SN_MR)] & 0x0f {
                    _ if self.reject_open => 0x00,
                    0x01 => 0x13,
                    0x02 => 0x22,
                    0x03 => 0x32,
                    0x04 => 0x42,
                    _ => 0x00,
                };
                self.set_status(n, status);
                for offset in [SN_TX_RD, SN_TX_WR, SN_RX_RD, SN_RX_WR] {
                    self.set16(n, offset, self.pointer_base);
                }
            }
            0x02 if self.status(n) == 0x13 => self.set_status(n, 0x14),
            0x04 if self.status(n) == 0x13 => self.set_status(n, 0x15),
            0x08 | 0x10 => self.set_status(n, 0x00),
            0x20 | 0x21 => self.transmit(n, cmd),
            _ => {}
        }
    }

    fn transmit(&mut self, n: usize, command: u8) {
        let rd = self.get16(n, SN_TX_RD);
        let wr = self.get16(n, SN_TX_WR);
        let data = (0..wr.wrapping_sub(rd))
            .map(|i| self.mem[Self::tx_base(n) + (rd.wrapping_add(i) & MASK) as usize])
            .collect();
        self.set16(n, SN_TX_RD, wr);
        self.mem[Self::reg(n, SN_IR)] |= if self.send_timeout { 0x08 } else { 0x10 };

        let sent = Sent {
            socket: n,
            command,
            dest: self.dest(n),
            data,
        };
        if let Some(mut responder) = self.responder.take() {
            if let Some(reply) = responder(&sent) {
                self.inject_udp(n, sent.dest, &reply);
            }
            self.responder = Some(responder);
        }
        self.sent.push(sent);
    }
}

impl Peripheral for W5200Sim {
    fn select(&mut self) {
        self.frame.clear();
    }

    fn exchange(&mut self, byte: u8) -> u8 {
        let pos = self.frame.len();
        self.frame.push(byte);
        if pos < 4 {
            return 0;
        }
        let (addr, write, len) = self.header();
        assert!(pos - 4 < len, "frame longer than its length field");
        if write {
            0
        } else {
            self.load(addr + (pos - 4) as u16)
        }
    }

    fn deselect(&mut self) {
        if self.frame.len() < 4 {
            return;
        }
        let (addr, write, len) = self.header();
        assert_eq!(self.frame.len() - 4, len, "frame shorter than its length field");
        if write {
            let data = core::mem::take(&mut self.frame);
            for (i, &byte) in data[4..].iter().enumerate() {
                self.store(addr + i as u16, byte);
            }
        }
    }
}
