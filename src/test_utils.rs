//! Host-test doubles: a behavioural model of the chip's SPI slave port
//! plus reset-pin and delay fakes, all sharing one [`SimState`].
//!
//! The model decodes the command stream byte by byte, keeps the four
//! register banks and the 8 KiB buffer memory, and records an event trace
//! the tests assert against. Just enough behaviour is modelled to exercise
//! the driver: bank selection through ECON1, the MAC-class dummy read
//! byte, pointer auto-increment with the receive ring wrap, eager
//! transmit completion and EPKTCNT decrement.

extern crate std;

use core::cell::RefCell;
use core::convert::Infallible;
use std::rc::Rc;
use std::vec::Vec;

use crate::registers::{Bank, RX_BUF_START};
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{self, OutputPin};
use embedded_hal::spi::{self, Operation, SpiDevice};

pub type SimHandle = Rc<RefCell<SimState>>;

pub fn sim() -> SimHandle {
    Rc::new(RefCell::new(SimState::new()))
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Event {
    RegWrite { bank: u8, addr: u8, value: u8 },
    BitSet { addr: u8, mask: u8 },
    BitClear { addr: u8, mask: u8 },
    BufWrite { len: usize },
    BufRead { len: usize },
    HardReset,
}

/// Per-transaction decoder state; reset on every chip-select release.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Decoder {
    Idle,
    /// Register read; `dummy_sent` tracks the MAC-class filler byte.
    Rcr { addr: u8, dummy_sent: bool },
    Wcr { addr: u8 },
    Bfs { addr: u8 },
    Bfc { addr: u8 },
    BufRead { count: usize },
    BufWrite { count: usize },
}

pub struct SimState {
    /// Four banks of 0x20 registers; the common block (>= 0x1b) is stored
    /// in the bank 0 row regardless of BSEL.
    regs: [[u8; 0x20]; 4],
    mem: [u8; 0x2000],
    decoder: Decoder,
    txn_bytes: usize,
    /// Where the next injected frame lands; mirrors the hardware write
    /// pointer closely enough for frames injected in order.
    rx_fill: u16,
    /// Drives ESTAT.CLKRDY.
    pub clk_ready: bool,
    /// When set, raising ECON1.TXRTS completes the transmission at once:
    /// the staged frame is captured, TXRTS drops and EIR.TXIF rises.
    pub tx_eager_complete: bool,
    pub last_tx_frame: Vec<u8>,
    pub elapsed_ns: u64,
    pub trace: Vec<Event>,
    /// Total bytes clocked in each completed transaction.
    pub txn_sizes: Vec<usize>,
}

impl SimState {
    pub fn new() -> Self {
        Self {
            regs: [[0; 0x20]; 4],
            mem: [0; 0x2000],
            decoder: Decoder::Idle,
            txn_bytes: 0,
            rx_fill: RX_BUF_START,
            clk_ready: true,
            tx_eager_complete: true,
            last_tx_frame: Vec::new(),
            elapsed_ns: 0,
            trace: Vec::new(),
            txn_sizes: Vec::new(),
        }
    }

    //
    // Register backing store; tests poke and peek through these.
    //

    fn slot(&mut self, bank: u8, addr: u8) -> &mut u8 {
        let bank = if addr >= 0x1b { 0 } else { bank as usize };
        &mut self.regs[bank][addr as usize]
    }

    pub fn write_reg(&mut self, bank: Bank, addr: u8, value: u8) {
        *self.slot(bank as u8, addr) = value;
    }

    pub fn read_reg(&self, bank: Bank, addr: u8) -> u8 {
        let row = if addr >= 0x1b { 0 } else { bank as usize };
        let value = self.regs[row][addr as usize];
        // CLKRDY reflects the oscillator, not a stored bit.
        if addr == 0x1d {
            (value & !0x01) | u8::from(self.clk_ready)
        } else {
            value
        }
    }

    pub fn read_reg16(&self, bank: Bank, low_addr: u8) -> u16 {
        let low = self.read_reg(bank, low_addr);
        let high = self.read_reg(bank, low_addr + 1);
        u16::from(high) << 8 | u16::from(low)
    }

    fn current_bank(&self) -> u8 {
        self.regs[0][0x1f] & 0x03
    }

    fn banked_read(&self, addr: u8) -> u8 {
        self.read_reg(bank_from(self.current_bank()), addr)
    }

    fn banked_write(&mut self, addr: u8, value: u8) {
        *self.slot(self.current_bank(), addr) = value;
    }

    /// Whether the currently-banked register at `addr` is MAC/MII class,
    /// i.e. prepends a dummy byte on reads.
    fn is_mac_mii(&self, addr: u8) -> bool {
        if addr >= 0x1b {
            return false;
        }
        match self.current_bank() {
            2 => true,
            3 => addr <= 0x05 || addr == 0x0a,
            _ => false,
        }
    }

    //
    // Frame injection
    //

    /// Lay a received frame into buffer memory at the fill cursor, with
    /// its six-byte header and pad byte, and bump EPKTCNT. Returns the
    /// next-packet pointer written into the header.
    pub fn inject_frame(&mut self, payload: &[u8]) -> u16 {
        let len = payload.len() as u16;
        let next = self.rx_fill + 6 + len + (len & 1);
        self.inject_frame_with_next(next, payload);
        next
    }

    pub fn inject_frame_with_next(&mut self, next: u16, payload: &[u8]) {
        let len = payload.len() as u16;
        let mut cursor = self.rx_fill;
        let mut push = |state: &mut Self, byte: u8| {
            state.mem[cursor as usize] = byte;
            cursor += 1;
        };
        push(self, next as u8);
        push(self, (next >> 8) as u8);
        push(self, len as u8);
        push(self, (len >> 8) as u8);
        // Status word: received OK.
        push(self, 0x80);
        push(self, 0x00);
        for &byte in payload {
            push(self, byte);
        }
        if len % 2 != 0 {
            push(self, 0x00);
        }
        self.rx_fill = cursor;
        self.regs[1][0x19] = self.regs[1][0x19].saturating_add(1);
    }

    //
    // Command stream decoding
    //

    fn transfer_byte(&mut self, mosi: u8) -> u8 {
        self.txn_bytes += 1;
        match self.decoder {
            Decoder::Idle => {
                self.decoder = match mosi {
                    0x3a => Decoder::BufRead { count: 0 },
                    0x7a => Decoder::BufWrite { count: 0 },
                    0xff => Decoder::Idle, // soft reset, unused here
                    cmd => {
                        let addr = cmd & 0x1f;
                        match cmd & 0xe0 {
                            0x00 => Decoder::Rcr {
                                addr,
                                dummy_sent: false,
                            },
                            0x40 => Decoder::Wcr { addr },
                            0x80 => Decoder::Bfs { addr },
                            0xa0 => Decoder::Bfc { addr },
                            other => panic!("unknown command byte {other:#04x}"),
                        }
                    }
                };
                0
            }
            Decoder::Rcr { addr, dummy_sent } => {
                if self.is_mac_mii(addr) && !dummy_sent {
                    self.decoder = Decoder::Rcr {
                        addr,
                        dummy_sent: true,
                    };
                    0
                } else {
                    self.banked_read(addr)
                }
            }
            Decoder::Wcr { addr } => {
                self.trace.push(Event::RegWrite {
                    bank: self.current_bank(),
                    addr,
                    value: mosi,
                });
                self.banked_write(addr, mosi);
                self.decoder = Decoder::Idle;
                0
            }
            Decoder::Bfs { addr } => {
                self.trace.push(Event::BitSet { addr, mask: mosi });
                self.bit_field_set(addr, mosi);
                self.decoder = Decoder::Idle;
                0
            }
            Decoder::Bfc { addr } => {
                self.trace.push(Event::BitClear { addr, mask: mosi });
                let value = self.banked_read(addr);
                self.banked_write(addr, value & !mosi);
                self.decoder = Decoder::Idle;
                0
            }
            Decoder::BufRead { count } => {
                let rdpt = self.read_reg16(Bank::Bank0, 0x00);
                let byte = self.mem[rdpt as usize];
                // Auto-increment with the receive ring wrap.
                let erxnd = self.read_reg16(Bank::Bank0, 0x0a);
                let next = if rdpt == erxnd {
                    self.read_reg16(Bank::Bank0, 0x08)
                } else {
                    (rdpt + 1) & 0x1fff
                };
                self.regs[0][0x00] = next as u8;
                self.regs[0][0x01] = (next >> 8) as u8;
                self.decoder = Decoder::BufRead { count: count + 1 };
                byte
            }
            Decoder::BufWrite { count } => {
                let wrpt = self.read_reg16(Bank::Bank0, 0x02);
                self.mem[wrpt as usize] = mosi;
                let next = (wrpt + 1) & 0x1fff;
                self.regs[0][0x02] = next as u8;
                self.regs[0][0x03] = (next >> 8) as u8;
                self.decoder = Decoder::BufWrite { count: count + 1 };
                0
            }
        }
    }

    fn bit_field_set(&mut self, addr: u8, mask: u8) {
        // ECON2.PKTDEC is self-clearing: it decrements EPKTCNT and never
        // reads back.
        let mask = if addr == 0x1e && mask & 0x40 != 0 {
            self.regs[1][0x19] = self.regs[1][0x19].saturating_sub(1);
            mask & !0x40
        } else {
            mask
        };
        let value = self.banked_read(addr) | mask;
        self.banked_write(addr, value);
        // Raising TXRTS starts a transmission; complete it on the spot
        // unless a test wants the bit to stick.
        if addr == 0x1f && mask & 0x08 != 0 {
            self.on_transmit_start();
        }
    }

    fn on_transmit_start(&mut self) {
        if !self.tx_eager_complete {
            return;
        }
        let etxst = self.read_reg16(Bank::Bank0, 0x04);
        let etxnd = self.read_reg16(Bank::Bank0, 0x06);
        // Skip the control byte at ETXST.
        self.last_tx_frame = self.mem[(etxst + 1) as usize..=(etxnd as usize)].to_vec();
        self.regs[0][0x1f] &= !0x08;
        self.regs[0][0x1c] |= 0x08;
    }

    fn end_transaction(&mut self) {
        match self.decoder {
            Decoder::BufRead { count } if count > 0 => {
                self.trace.push(Event::BufRead { len: count });
            }
            Decoder::BufWrite { count } if count > 0 => {
                self.trace.push(Event::BufWrite { len: count });
            }
            _ => {}
        }
        self.decoder = Decoder::Idle;
        self.txn_sizes.push(self.txn_bytes);
        self.txn_bytes = 0;
    }

    fn hard_reset(&mut self) {
        self.regs = [[0; 0x20]; 4];
        self.rx_fill = RX_BUF_START;
        self.decoder = Decoder::Idle;
        self.trace.push(Event::HardReset);
    }
}

fn bank_from(bits: u8) -> Bank {
    match bits & 0x03 {
        0 => Bank::Bank0,
        1 => Bank::Bank1,
        2 => Bank::Bank2,
        _ => Bank::Bank3,
    }
}

pub struct SimSpi {
    state: SimHandle,
}

impl SimSpi {
    pub fn new(state: SimHandle) -> Self {
        Self { state }
    }

    pub fn state(&self) -> SimHandle {
        self.state.clone()
    }
}

impl spi::ErrorType for SimSpi {
    type Error = Infallible;
}

impl SpiDevice for SimSpi {
    fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), Infallible> {
        let mut state = self.state.borrow_mut();
        for op in operations {
            match op {
                Operation::Write(data) => {
                    for &byte in data.iter() {
                        state.transfer_byte(byte);
                    }
                }
                Operation::Read(out) => {
                    for byte in out.iter_mut() {
                        *byte = state.transfer_byte(0);
                    }
                }
                Operation::Transfer(read, write) => {
                    for i in 0..read.len().max(write.len()) {
                        let mosi = write.get(i).copied().unwrap_or(0);
                        let miso = state.transfer_byte(mosi);
                        if let Some(slot) = read.get_mut(i) {
                            *slot = miso;
                        }
                    }
                }
                Operation::TransferInPlace(data) => {
                    for byte in data.iter_mut() {
                        *byte = state.transfer_byte(*byte);
                    }
                }
                Operation::DelayNs(ns) => {
                    state.elapsed_ns += u64::from(*ns);
                }
            }
        }
        state.end_transaction();
        Ok(())
    }
}

pub struct SimResetPin {
    state: SimHandle,
    held_low: bool,
}

impl SimResetPin {
    pub fn new(state: SimHandle) -> Self {
        Self {
            state,
            held_low: false,
        }
    }
}

impl digital::ErrorType for SimResetPin {
    type Error = Infallible;
}

impl OutputPin for SimResetPin {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.held_low = true;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        if self.held_low {
            self.state.borrow_mut().hard_reset();
            self.held_low = false;
        }
        Ok(())
    }
}

pub struct SimDelay {
    state: SimHandle,
}

impl SimDelay {
    pub fn new(state: SimHandle) -> Self {
        Self { state }
    }
}

impl DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.state.borrow_mut().elapsed_ns += u64::from(ns);
    }
}
