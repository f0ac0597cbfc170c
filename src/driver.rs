//! Polled driver for the ENC28J60.
//!
//! The driver owns the SPI device, the reset line and a delay source, and
//! exposes four operations to the caller's polling loop: [`Enc28j60::init`],
//! [`Enc28j60::send`], [`Enc28j60::receive`] and [`Enc28j60::tick`]. All of
//! them run to completion on the calling thread; the only waits are the
//! bounded busy-polls on ESTAT.CLKRDY and ECON1.TXRTS.

use crate::registers::{
    BBIPG_FULL_DUPLEX, BSEL_MASK, Bank, ECON1, ECON2, EIR, EPKTCNT, ERDPT, EREVID, ERXFCON, ERXND,
    ERXRDPT, ERXST, ESTAT, ETXND, ETXST, EWRPT, Econ1, Econ2, Eir, Erxfcon, Estat,
    IPG_FULL_DUPLEX, MAADR1, MAADR2, MAADR3, MAADR4, MAADR5, MAADR6, MABBIPG, MACON1, MACON3,
    MAIPGL, MAMXFL, MAX_FRAME_LEN, Macon1, Macon3, Opcode, PPCB_DEFAULT, RX_BUF_END, RX_BUF_START,
    Register, RegisterPair, RxFrameHeader, TX_BUF_START, reg_cmd,
};
#[cfg(feature = "defmt")]
use crate::registers::TxStatusVector;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{Error as _, OutputPin};
use embedded_hal::spi::{self, Operation, SpiDevice};

/// How long the reset line is held low, and how long each post-release
/// settle step takes. The second settle step is the erratum #2 guard:
/// CLKRDY can read high before the oscillator has actually stabilized.
const RESET_HOLD_MS: u32 = 2;
/// Oscillator start-up timer wait.
const OST_TIMEOUT_MS: u32 = 5_000;
/// Transmit completion wait.
const TX_TIMEOUT_MS: u32 = 5_000;
/// Link-health watchdog evaluation window.
const WATCHDOG_INTERVAL_MS: u32 = 30_000;

/// Chunk size used when draining an oversized frame out of the receive
/// ring.
const DRAIN_CHUNK: usize = 32;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    Spi(spi::ErrorKind),
    ResetPin(embedded_hal::digital::ErrorKind),
    /// ESTAT.CLKRDY stayed low for the whole oscillator start-up window.
    /// The initialization attempt is abandoned; callers retry as policy
    /// dictates.
    TimedOutWaitingForClock,
    /// ECON1.TXRTS never cleared. The frame is abandoned, nothing is
    /// retried, and the sent-frame counter is not incremented.
    TimedOutTransmitting,
    /// The caller's buffer is smaller than the pending frame. The frame
    /// has already been drained from the ring (the read pointer must
    /// advance regardless) and is lost.
    ReceiveBufferTooSmall { len: u16, capacity: usize },
    /// The frame exceeds the maximum frame length programmed into MAMXFL.
    FrameTooLong { len: usize, max: u16 },
}

impl<SE: spi::Error> From<SE> for Error {
    fn from(value: SE) -> Self {
        Self::Spi(value.kind())
    }
}

/// Fixed-interval timer fed with a caller-supplied monotonic millisecond
/// timestamp. Drives the link-health watchdog.
#[derive(Copy, Clone, Debug)]
pub struct PeriodicTimer {
    interval_ms: u32,
    last_ms: u32,
}

impl PeriodicTimer {
    pub const fn new(interval_ms: u32) -> Self {
        Self {
            interval_ms,
            last_ms: 0,
        }
    }

    /// True once per interval; returning true restarts the window.
    pub fn has_elapsed(&mut self, now_ms: u32) -> bool {
        if now_ms.wrapping_sub(self.last_ms) >= self.interval_ms {
            self.last_ms = now_ms;
            true
        } else {
            false
        }
    }
}

/// ENC28J60 device handle. Every operation may move the register bank, so
/// all calls must be serialized through one owner.
pub struct Enc28j60<SPI: SpiDevice, RST: OutputPin, D: DelayNs> {
    spi: SPI,
    rst: RST,
    delay: D,
    mac_addr: [u8; 6],
    /// Cached copy of ECON1.BSEL. Must always match the chip; every write
    /// that touches BSEL goes through `select_bank`.
    bank: Bank,
    sent_frames: u32,
    received_frames: u32,
    watchdog: PeriodicTimer,
}

impl<SPI: SpiDevice, RST: OutputPin, D: DelayNs> Enc28j60<SPI, RST, D> {
    /// Create a driver from the SPI device, the reset line, a delay source
    /// and the station MAC address. The chip is not touched until
    /// [`init`](Self::init).
    pub fn new(spi: SPI, rst: RST, delay: D, mac_addr: [u8; 6]) -> Self {
        Self {
            spi,
            rst,
            delay,
            mac_addr,
            bank: Bank::Bank0,
            sent_frames: 0,
            received_frames: 0,
            watchdog: PeriodicTimer::new(WATCHDOG_INTERVAL_MS),
        }
    }

    /// The station MAC address programmed at initialization.
    pub fn mac_addr(&self) -> [u8; 6] {
        self.mac_addr
    }

    /// One attempt of the full reset and bring-up sequence.
    ///
    /// This:
    /// - pulses the hardware reset line
    /// - waits for the oscillator start-up timer
    /// - programs the receive ring bounds and pointers
    /// - enables the unicast, broadcast and CRC receive filters
    /// - configures the MAC for full duplex with padding and CRC
    /// - programs the station MAC address
    /// - enables pointer auto-increment and frame reception
    ///
    /// The chip can genuinely fail to come up (bad wiring, no clock), so
    /// callers wanting retry-until-up behaviour loop on
    /// [`Error::TimedOutWaitingForClock`].
    pub fn init(&mut self) -> Result<(), Error> {
        self.reset()?;
        #[cfg(feature = "defmt")]
        defmt::info!("ENC28J60 rev. B{}", self.revision()?);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), Error> {
        self.rst.set_low().map_err(|e| Error::ResetPin(e.kind()))?;
        self.delay.delay_ms(RESET_HOLD_MS);
        self.rst.set_high().map_err(|e| Error::ResetPin(e.kind()))?;
        self.delay.delay_ms(RESET_HOLD_MS);
        // Erratum #2: CLKRDY is not reliable straight out of reset.
        self.delay.delay_ms(RESET_HOLD_MS);

        // Hardware reset leaves BSEL at zero.
        self.bank = Bank::Bank0;

        if !self.wait_reg_bit(ESTAT, Estat::CLKRDY.bits(), true, OST_TIMEOUT_MS)? {
            return Err(Error::TimedOutWaitingForClock);
        }

        // Receive ring bounds. ERXRDPT starts at the ring end per the
        // chip's freeing convention, ERDPT at the start where the first
        // frame header will land.
        self.write_reg16(ERXST, RX_BUF_START)?;
        self.write_reg16(ERXND, RX_BUF_END)?;
        self.write_reg16(ERDPT, RX_BUF_START)?;
        self.write_reg16(ERXRDPT, RX_BUF_END)?;

        // Accept our unicast and broadcast, CRC-checked; everything else
        // stays filtered out.
        self.write_reg(
            ERXFCON,
            (Erxfcon::UCEN | Erxfcon::CRCEN | Erxfcon::BCEN).bits(),
        )?;

        // MAC receive enable plus IEEE flow control pause handling.
        self.set_bits(
            MACON1,
            (Macon1::MARXEN | Macon1::TXPAUS | Macon1::RXPAUS).bits(),
        )?;
        // Pad to 60 bytes, append CRC, full duplex, check frame length.
        self.set_bits(
            MACON3,
            (Macon3::PADCFG_FULL | Macon3::TXCRCEN | Macon3::FULDPX | Macon3::FRMLNEN).bits(),
        )?;
        self.write_reg16(MAMXFL, MAX_FRAME_LEN)?;
        // Full-duplex inter-packet gaps; MAIPGH only matters in half
        // duplex.
        self.write_reg(MABBIPG, BBIPG_FULL_DUPLEX)?;
        self.write_reg(MAIPGL, IPG_FULL_DUPLEX)?;

        // Station address, most significant octet in MAADR1.
        self.write_reg(MAADR6, self.mac_addr[5])?;
        self.write_reg(MAADR5, self.mac_addr[4])?;
        self.write_reg(MAADR4, self.mac_addr[3])?;
        self.write_reg(MAADR3, self.mac_addr[2])?;
        self.write_reg(MAADR2, self.mac_addr[1])?;
        self.write_reg(MAADR1, self.mac_addr[0])?;

        // Advance ERDPT/EWRPT on every buffer access.
        self.set_bits(ECON2, Econ2::AUTOINC.bits())?;
        // Bit-field set rather than a plain write so BSEL stays intact.
        self.set_bits(ECON1, Econ1::RXEN.bits())?;

        Ok(())
    }

    /// Silicon revision, with the EREVID quirk decoded: the register reads
    /// 2 on B1 silicon, 4 on B4, 5 on B5 and 6 on B7.
    pub fn revision(&mut self) -> Result<u8, Error> {
        let rev = self.read_reg(EREVID)?;
        Ok(match rev {
            2 => 1,
            6 => 7,
            other => other,
        })
    }

    /// Stage `frame` in buffer memory, start transmission and wait for it
    /// to finish. Only one transmission is ever in flight; every call
    /// restarts from the same staging address.
    ///
    /// Returns the number of bytes sent. The sent-frame counter counts
    /// every completed attempt, including ones the hardware flags as
    /// aborted; the watchdog heuristic depends on that.
    pub fn send(&mut self, frame: &[u8]) -> Result<usize, Error> {
        if frame.len() > usize::from(MAX_FRAME_LEN) {
            return Err(Error::FrameTooLong {
                len: frame.len(),
                max: MAX_FRAME_LEN,
            });
        }

        self.write_reg16(ETXST, TX_BUF_START)?;
        self.write_reg16(EWRPT, TX_BUF_START)?;

        // Per-packet control byte, then the frame, in one WBM burst.
        self.spi.transaction(&mut [
            Operation::Write(&[Opcode::Wbm as u8]),
            Operation::Write(&[PPCB_DEFAULT]),
            Operation::Write(frame),
        ])?;

        // The control byte sits at ETXST, so the payload occupies
        // ETXST+1 ..= ETXST+len, and ETXND points at the last payload
        // byte.
        let data_end = TX_BUF_START + frame.len() as u16;
        self.write_reg16(ETXND, data_end)?;

        self.clear_bits(EIR, Eir::TXIF.bits())?;
        self.set_bits(ECON1, Econ1::TXRTS.bits())?;

        if !self.wait_reg_bit(ECON1, Econ1::TXRTS.bits(), false, TX_TIMEOUT_MS)? {
            #[cfg(feature = "defmt")]
            defmt::warn!("timeout sending frame of {} bytes", frame.len());
            return Err(Error::TimedOutTransmitting);
        }

        #[cfg(feature = "defmt")]
        self.log_transmit_status(data_end)?;

        self.sent_frames = self.sent_frames.wrapping_add(1);
        Ok(frame.len())
    }

    /// On a hardware-reported abort, read back the status vector the chip
    /// appended after the frame. ERDPT is saved and restored around the
    /// readout so the receive path is undisturbed.
    #[cfg(feature = "defmt")]
    fn log_transmit_status(&mut self, data_end: u16) -> Result<(), Error> {
        if self.read_reg(ESTAT)? & Estat::TXABRT.bits() == 0 {
            return Ok(());
        }
        let saved_rdpt = self.read_reg16(ERDPT)?;
        self.write_reg16(ERDPT, data_end + 1)?;
        let mut raw = [0u8; TxStatusVector::LEN];
        self.read_buffer(&mut raw)?;
        self.write_reg16(ERDPT, saved_rdpt)?;
        let tsv = TxStatusVector::from_bytes(raw);
        defmt::warn!(
            "tx aborted: {} collisions, late={}, underrun={}, {} bytes on wire",
            tsv.collision_count(),
            tsv.late_collision(),
            tsv.transmit_underrun(),
            tsv.total_bytes_transmitted,
        );
        Ok(())
    }

    /// Drain at most one frame from the receive ring into `buf`.
    ///
    /// Returns `Ok(None)` when nothing is pending. If `buf` is too small
    /// for the frame the chip declares, the frame is still consumed from
    /// the ring (the read pointer must advance either way) and the call
    /// fails with [`Error::ReceiveBufferTooSmall`].
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<Option<u16>, Error> {
        let pending = self.read_reg(EPKTCNT)?;
        if pending == 0 {
            return Ok(None);
        }

        let mut raw = [0u8; RxFrameHeader::LEN];
        self.read_buffer(&mut raw)?;
        let header = RxFrameHeader::from_bytes(raw);
        #[cfg(feature = "defmt")]
        defmt::debug!(
            "rx header: next={=u16:#06x} len={} ok={}",
            header.next_packet,
            header.len,
            header.received_ok(),
        );

        let len = header.len;
        let fits = buf.len() >= usize::from(len);
        if fits {
            self.read_buffer(&mut buf[..usize::from(len)])?;
        } else {
            self.drain_buffer(usize::from(len))?;
        }

        // Frames are stored on even boundaries; consume the pad byte so
        // ERDPT lands on the next frame header.
        if len % 2 != 0 {
            let mut pad = [0u8; 1];
            self.read_buffer(&mut pad)?;
        }

        // Erratum #14: ERXRDPT must be programmed to an odd address, one
        // byte behind the next-packet pointer, with wrap to the ring end
        // when the next pointer equals the ring start.
        let next = if header.next_packet == RX_BUF_START {
            RX_BUF_END
        } else {
            header.next_packet - 1
        };
        self.write_reg16(ERXRDPT, next)?;

        self.set_bits(ECON2, Econ2::PKTDEC.bits())?;

        if !fits {
            #[cfg(feature = "defmt")]
            defmt::warn!("rx overflow: {} byte frame, {} byte buffer", len, buf.len());
            return Err(Error::ReceiveBufferTooSmall {
                len,
                capacity: buf.len(),
            });
        }

        self.received_frames = self.received_frames.wrapping_add(1);
        Ok(Some(len))
    }

    /// Link-health watchdog; call once per loop iteration with a monotonic
    /// millisecond timestamp. Each time the 30 s window elapses the sent
    /// and received counters are zeroed. If the window saw outbound frames
    /// with strictly fewer inbound ones the chip is assumed wedged and the
    /// whole reset sequence is re-run. Returns whether a reset happened.
    ///
    /// This is a heuristic, not a liveness check: a quiet window with no
    /// sends does not trigger it.
    pub fn tick(&mut self, now_ms: u32) -> Result<bool, Error> {
        if !self.watchdog.has_elapsed(now_ms) {
            return Ok(false);
        }
        let stalled = self.received_frames < self.sent_frames;
        #[cfg(feature = "defmt")]
        defmt::debug!(
            "watchdog: sent={} received={} stalled={}",
            self.sent_frames,
            self.received_frames,
            stalled,
        );
        self.sent_frames = 0;
        self.received_frames = 0;
        if stalled {
            self.reset()?;
            return Ok(true);
        }
        Ok(false)
    }

    //
    // Register access
    //

    /// Point the chip at `bank` if it is not already there: read ECON1,
    /// swap the BSEL bits, write it back, update the cache.
    fn select_bank(&mut self, bank: Bank) -> Result<(), Error> {
        if bank == self.bank {
            return Ok(());
        }
        // ECON1 lives in the common block, so this read never recurses
        // into bank selection.
        let econ1 = self.read_reg(ECON1)?;
        self.write_reg_raw(ECON1, (econ1 & !BSEL_MASK) | bank.bits())?;
        self.bank = bank;
        Ok(())
    }

    fn read_reg(&mut self, reg: Register) -> Result<u8, Error> {
        if let Some(bank) = reg.bank() {
            self.select_bank(bank)?;
        }
        let cmd = [reg_cmd(Opcode::Rcr, reg.addr())];
        if reg.is_mac_mii() {
            // MAC and MII registers clock out a dummy byte before the
            // data.
            let mut out = [0u8; 2];
            self.spi
                .transaction(&mut [Operation::Write(&cmd), Operation::Read(&mut out)])?;
            Ok(out[1])
        } else {
            let mut out = [0u8; 1];
            self.spi
                .transaction(&mut [Operation::Write(&cmd), Operation::Read(&mut out)])?;
            Ok(out[0])
        }
    }

    fn write_reg(&mut self, reg: Register, value: u8) -> Result<(), Error> {
        if let Some(bank) = reg.bank() {
            self.select_bank(bank)?;
        }
        self.write_reg_raw(reg, value)
    }

    /// The WCR exchange itself, without bank handling. `select_bank` uses
    /// this for ECON1.
    fn write_reg_raw(&mut self, reg: Register, value: u8) -> Result<(), Error> {
        self.spi.write(&[reg_cmd(Opcode::Wcr, reg.addr()), value])?;
        Ok(())
    }

    /// Low byte first, then the high byte at `addr + 1`; some pointer
    /// registers latch on the high write.
    fn write_reg16(&mut self, pair: RegisterPair, value: u16) -> Result<(), Error> {
        self.write_reg(pair.low, value as u8)?;
        self.write_reg(pair.high, (value >> 8) as u8)
    }

    #[cfg_attr(not(feature = "defmt"), allow(dead_code))]
    fn read_reg16(&mut self, pair: RegisterPair) -> Result<u16, Error> {
        let low = self.read_reg(pair.low)?;
        let high = self.read_reg(pair.high)?;
        Ok(u16::from(high) << 8 | u16::from(low))
    }

    /// Set `mask` bits: a single BFS exchange for ETH-class registers,
    /// read-modify-write for MAC/MII-class (the chip has no bit-field
    /// opcodes for those).
    fn set_bits(&mut self, reg: Register, mask: u8) -> Result<(), Error> {
        if reg.is_mac_mii() {
            let value = self.read_reg(reg)?;
            self.write_reg(reg, value | mask)
        } else {
            if let Some(bank) = reg.bank() {
                self.select_bank(bank)?;
            }
            self.spi.write(&[reg_cmd(Opcode::Bfs, reg.addr()), mask])?;
            Ok(())
        }
    }

    fn clear_bits(&mut self, reg: Register, mask: u8) -> Result<(), Error> {
        if reg.is_mac_mii() {
            let value = self.read_reg(reg)?;
            self.write_reg(reg, value & !mask)
        } else {
            if let Some(bank) = reg.bank() {
                self.select_bank(bank)?;
            }
            self.spi.write(&[reg_cmd(Opcode::Bfc, reg.addr()), mask])?;
            Ok(())
        }
    }

    //
    // Buffer memory access
    //

    /// RBM: one opcode then `out.len()` data bytes within a single chip
    /// select assertion, starting at ERDPT. With ECON2.AUTOINC set the
    /// pointer persists across calls and wraps inside the receive ring.
    fn read_buffer(&mut self, out: &mut [u8]) -> Result<(), Error> {
        self.spi.transaction(&mut [
            Operation::Write(&[Opcode::Rbm as u8]),
            Operation::Read(out),
        ])?;
        Ok(())
    }

    /// Read and throw away `count` bytes, keeping ERDPT moving.
    fn drain_buffer(&mut self, count: usize) -> Result<(), Error> {
        let mut scratch = [0u8; DRAIN_CHUNK];
        let mut remaining = count;
        while remaining > 0 {
            let chunk = remaining.min(DRAIN_CHUNK);
            self.read_buffer(&mut scratch[..chunk])?;
            remaining -= chunk;
        }
        Ok(())
    }

    //
    // Polled waits
    //

    /// Poll `reg` until `(value & mask) != 0` equals `set`, sleeping 1 ms
    /// between reads, for at most `timeout_ms`. Returns whether the
    /// condition was met before the deadline.
    fn wait_reg_bit(
        &mut self,
        reg: Register,
        mask: u8,
        set: bool,
        timeout_ms: u32,
    ) -> Result<bool, Error> {
        for _ in 0..timeout_ms {
            let value = self.read_reg(reg)?;
            if ((value & mask) != 0) == set {
                return Ok(true);
            }
            self.delay.delay_ms(1);
        }
        Ok(false)
    }
}
