//! SPI command set and control register map for the ENC28J60.
//!
//! The chip multiplexes its register space through four banks selected by
//! ECON1.BSEL, with a five-register common block (0x1B..=0x1F) visible from
//! every bank. Each [`Register`] constant carries its bank and its class:
//! MAC/MII-class registers clock a dummy byte ahead of the data on reads and
//! have no bit-field set/clear opcodes, so the access layer must know which
//! is which.

use bitflags::bitflags;

/// Low five bits of a command byte select the register address.
pub(crate) const ADDR_MASK: u8 = 0x1f;
/// ECON1 bits 1:0 select the active register bank.
pub(crate) const BSEL_MASK: u8 = 0x03;

/// SPI instruction set. RCR/WCR/BFS/BFC carry a register address in their
/// low five bits; RBM, WBM and SRC are complete single-byte commands.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum Opcode {
    /// Read Control Register
    Rcr = 0x00,
    /// Read Buffer Memory
    Rbm = 0x3a,
    /// Write Control Register
    Wcr = 0x40,
    /// Write Buffer Memory
    Wbm = 0x7a,
    /// Bit Field Set (ETH registers only)
    Bfs = 0x80,
    /// Bit Field Clear (ETH registers only)
    Bfc = 0xa0,
    /// System Reset Command (soft reset)
    Src = 0xff,
}

pub(crate) fn reg_cmd(op: Opcode, addr: u8) -> u8 {
    (op as u8) | (addr & ADDR_MASK)
}

/// One of the four register banks.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Bank {
    Bank0 = 0,
    Bank1 = 1,
    Bank2 = 2,
    Bank3 = 3,
}

impl Bank {
    pub(crate) const fn bits(self) -> u8 {
        self as u8
    }
}

/// An 8-bit control register: address, bank, and register class.
///
/// `bank == None` marks the common block reachable from any bank.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Register {
    bank: Option<Bank>,
    addr: u8,
    mac_mii: bool,
}

impl Register {
    /// An ETH-class register: no dummy read byte, BFS/BFC usable.
    const fn eth(bank: Option<Bank>, addr: u8) -> Self {
        Self {
            bank,
            addr,
            mac_mii: false,
        }
    }

    /// A MAC/MII-class register: reads clock a dummy byte first and bit
    /// fields can only be changed by read-modify-write.
    const fn mac(bank: Bank, addr: u8) -> Self {
        Self {
            bank: Some(bank),
            addr,
            mac_mii: true,
        }
    }

    pub const fn addr(self) -> u8 {
        self.addr
    }

    pub const fn bank(self) -> Option<Bank> {
        self.bank
    }

    pub const fn is_mac_mii(self) -> bool {
        self.mac_mii
    }
}

/// A 16-bit quantity split over two adjacent 8-bit registers, low byte
/// first. The chip latches some of these (e.g. ERXRDPT) on the high write,
/// so the access layer always writes low then high.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct RegisterPair {
    pub(crate) low: Register,
    pub(crate) high: Register,
}

impl RegisterPair {
    const fn new(low: Register, high: Register) -> Self {
        assert!(low.addr + 1 == high.addr);
        assert!(
            match (low.bank, high.bank) {
                (Some(l), Some(h)) => l as u8 == h as u8,
                (None, None) => true,
                _ => false,
            },
            "paired registers must live in the same bank"
        );
        Self { low, high }
    }
}

//
// Common block (0x1B..=0x1F), visible from every bank
//

pub const EIE: Register = Register::eth(None, 0x1b);
pub const EIR: Register = Register::eth(None, 0x1c);
pub const ESTAT: Register = Register::eth(None, 0x1d);
pub const ECON2: Register = Register::eth(None, 0x1e);
pub const ECON1: Register = Register::eth(None, 0x1f);

bitflags! {
    /// EIR: interrupt request flags (polled here, never wired to an IRQ).
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct Eir: u8 {
        const PKTIF = 0x40;
        const DMAIF = 0x20;
        const LINKIF = 0x10;
        const TXIF = 0x08;
        const TXERIF = 0x02;
        const RXERIF = 0x01;
    }
}

bitflags! {
    /// ESTAT: Ethernet status.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct Estat: u8 {
        const INT = 0x80;
        const LATECOL = 0x10;
        const RXBUSY = 0x04;
        const TXABRT = 0x02;
        const CLKRDY = 0x01;
    }
}

bitflags! {
    /// ECON2: packet decrement, pointer auto-increment, power saving.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct Econ2: u8 {
        const AUTOINC = 0x80;
        const PKTDEC = 0x40;
        const PWRSV = 0x20;
        const VRPS = 0x08;
    }
}

bitflags! {
    /// ECON1: transmit/receive control and the bank select bits.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct Econ1: u8 {
        const TXRST = 0x80;
        const RXRST = 0x40;
        const DMAST = 0x20;
        const CSUMEN = 0x10;
        const TXRTS = 0x08;
        const RXEN = 0x04;
        const BSEL1 = 0x02;
        const BSEL0 = 0x01;
    }
}

//
// Bank 0: buffer pointers
//

pub const ERDPTL: Register = Register::eth(Some(Bank::Bank0), 0x00);
pub const ERDPTH: Register = Register::eth(Some(Bank::Bank0), 0x01);
/// Buffer memory read pointer (RBM reads start here).
pub const ERDPT: RegisterPair = RegisterPair::new(ERDPTL, ERDPTH);

pub const EWRPTL: Register = Register::eth(Some(Bank::Bank0), 0x02);
pub const EWRPTH: Register = Register::eth(Some(Bank::Bank0), 0x03);
/// Buffer memory write pointer (WBM writes start here).
pub const EWRPT: RegisterPair = RegisterPair::new(EWRPTL, EWRPTH);

pub const ETXSTL: Register = Register::eth(Some(Bank::Bank0), 0x04);
pub const ETXSTH: Register = Register::eth(Some(Bank::Bank0), 0x05);
/// Transmit buffer start (points at the per-packet control byte).
pub const ETXST: RegisterPair = RegisterPair::new(ETXSTL, ETXSTH);

pub const ETXNDL: Register = Register::eth(Some(Bank::Bank0), 0x06);
pub const ETXNDH: Register = Register::eth(Some(Bank::Bank0), 0x07);
/// Transmit buffer end (points at the last payload byte).
pub const ETXND: RegisterPair = RegisterPair::new(ETXNDL, ETXNDH);

pub const ERXSTL: Register = Register::eth(Some(Bank::Bank0), 0x08);
pub const ERXSTH: Register = Register::eth(Some(Bank::Bank0), 0x09);
/// Receive ring start.
pub const ERXST: RegisterPair = RegisterPair::new(ERXSTL, ERXSTH);

pub const ERXNDL: Register = Register::eth(Some(Bank::Bank0), 0x0a);
pub const ERXNDH: Register = Register::eth(Some(Bank::Bank0), 0x0b);
/// Receive ring end (inclusive).
pub const ERXND: RegisterPair = RegisterPair::new(ERXNDL, ERXNDH);

pub const ERXRDPTL: Register = Register::eth(Some(Bank::Bank0), 0x0c);
pub const ERXRDPTH: Register = Register::eth(Some(Bank::Bank0), 0x0d);
/// Receive ring read pointer: the hardware will not write past it.
pub const ERXRDPT: RegisterPair = RegisterPair::new(ERXRDPTL, ERXRDPTH);

pub const ERXWRPTL: Register = Register::eth(Some(Bank::Bank0), 0x0e);
pub const ERXWRPTH: Register = Register::eth(Some(Bank::Bank0), 0x0f);
/// Receive ring write pointer (read only, hardware managed).
pub const ERXWRPT: RegisterPair = RegisterPair::new(ERXWRPTL, ERXWRPTH);

//
// Bank 1: receive filters, packet count
//

pub const ERXFCON: Register = Register::eth(Some(Bank::Bank1), 0x18);
/// Count of frames pending in the receive ring.
pub const EPKTCNT: Register = Register::eth(Some(Bank::Bank1), 0x19);

bitflags! {
    /// ERXFCON: receive filter enables.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct Erxfcon: u8 {
        /// Unicast filter
        const UCEN = 0x80;
        /// AND/OR filter combination select
        const ANDOR = 0x40;
        /// Post-filter CRC check
        const CRCEN = 0x20;
        /// Pattern match filter
        const PMEN = 0x10;
        /// Magic packet filter
        const MPEN = 0x08;
        /// Hash table filter
        const HTEN = 0x04;
        /// Multicast filter
        const MCEN = 0x02;
        /// Broadcast filter
        const BCEN = 0x01;
    }
}

//
// Bank 2: MAC configuration (all MAC/MII class)
//

pub const MACON1: Register = Register::mac(Bank::Bank2, 0x00);
pub const MACON3: Register = Register::mac(Bank::Bank2, 0x02);
pub const MACON4: Register = Register::mac(Bank::Bank2, 0x03);
/// Back-to-back inter-packet gap.
pub const MABBIPG: Register = Register::mac(Bank::Bank2, 0x04);
pub const MAIPGL: Register = Register::mac(Bank::Bank2, 0x06);
pub const MAIPGH: Register = Register::mac(Bank::Bank2, 0x07);
pub const MAMXFLL: Register = Register::mac(Bank::Bank2, 0x0a);
pub const MAMXFLH: Register = Register::mac(Bank::Bank2, 0x0b);
/// Maximum permitted frame length.
pub const MAMXFL: RegisterPair = RegisterPair::new(MAMXFLL, MAMXFLH);

bitflags! {
    /// MACON1: MAC receive and flow control enables.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct Macon1: u8 {
        const LOOPBK = 0x10;
        /// Pause control frame transmission
        const TXPAUS = 0x08;
        /// Pause control frame reception
        const RXPAUS = 0x04;
        const PASSALL = 0x02;
        /// MAC receive enable
        const MARXEN = 0x01;
    }
}

bitflags! {
    /// MACON3: padding, CRC generation, duplex.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct Macon3: u8 {
        const PADCFG2 = 0x80;
        const PADCFG1 = 0x40;
        const PADCFG0 = 0x20;
        /// Pad to 60 bytes and append CRC, any frame type.
        const PADCFG_FULL = 0xe0;
        /// Append CRC on transmit
        const TXCRCEN = 0x10;
        const PHDRLEN = 0x08;
        const HFRMLEN = 0x04;
        /// Report frame length status
        const FRMLNEN = 0x02;
        /// Full duplex
        const FULDPX = 0x01;
    }
}

//
// Bank 3: station address, MII status, silicon revision
//

// The register layout numbers the address from its most-significant byte:
// MAADR1 holds octet 0 and MAADR6 octet 5, and the addresses interleave.
pub const MAADR5: Register = Register::mac(Bank::Bank3, 0x00);
pub const MAADR6: Register = Register::mac(Bank::Bank3, 0x01);
pub const MAADR3: Register = Register::mac(Bank::Bank3, 0x02);
pub const MAADR4: Register = Register::mac(Bank::Bank3, 0x03);
pub const MAADR1: Register = Register::mac(Bank::Bank3, 0x04);
pub const MAADR2: Register = Register::mac(Bank::Bank3, 0x05);

pub const MISTAT: Register = Register::mac(Bank::Bank3, 0x0a);
/// Silicon revision; see [`crate::driver::Enc28j60::revision`].
pub const EREVID: Register = Register::eth(Some(Bank::Bank3), 0x12);

//
// Buffer memory layout and MAC timing constants
//

/// Receive ring start. The erratum #5 workaround wants this at 0x0000
/// anyway, and an even address per the datasheet recommendation.
pub const RX_BUF_START: u16 = 0x0000;
/// Receive ring end, inclusive.
pub const RX_BUF_END: u16 = 0x0fff;
/// Fixed transmit staging address; only one frame is ever in flight, so
/// every send restarts here. Leaves room for the frame, its per-packet
/// control byte and the 7-byte status vector below the top of memory.
pub const TX_BUF_START: u16 = 0x1200;

/// Per-packet control byte: all zero means "use the MACON3 defaults".
pub const PPCB_DEFAULT: u8 = 0x00;

/// Maximum frame length programmed into MAMXFL.
pub const MAX_FRAME_LEN: u16 = 1518;
/// MABBIPG value for full duplex.
pub const BBIPG_FULL_DUPLEX: u8 = 0x15;
/// MAIPGL value; MAIPGH only matters for half duplex and is left alone.
pub const IPG_FULL_DUPLEX: u8 = 0x12;

/// Per-frame header the hardware prepends to every received frame: a
/// next-packet pointer, the payload length and a 16-bit status word, each
/// little-endian.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct RxFrameHeader {
    pub(crate) next_packet: u16,
    pub(crate) len: u16,
    pub(crate) status: u16,
}

impl RxFrameHeader {
    pub(crate) const LEN: usize = 6;

    pub(crate) fn from_bytes(raw: [u8; Self::LEN]) -> Self {
        Self {
            next_packet: u16::from_le_bytes([raw[0], raw[1]]),
            len: u16::from_le_bytes([raw[2], raw[3]]),
            status: u16::from_le_bytes([raw[4], raw[5]]),
        }
    }

    /// RSV "received OK" bit. Logged only; filtering already discarded
    /// bad-CRC frames.
    #[allow(dead_code)]
    pub(crate) fn received_ok(&self) -> bool {
        self.status & (1 << 7) != 0
    }
}

/// Seven-byte status vector the hardware appends after a transmitted
/// frame, read back for diagnostics when the chip flags an abort.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxStatusVector {
    pub byte_count: u16,
    pub status1: u16,
    pub total_bytes_transmitted: u16,
    pub status2: u8,
}

impl TxStatusVector {
    pub const LEN: usize = 7;

    pub fn from_bytes(raw: [u8; Self::LEN]) -> Self {
        Self {
            byte_count: u16::from_le_bytes([raw[0], raw[1]]),
            status1: u16::from_le_bytes([raw[2], raw[3]]),
            total_bytes_transmitted: u16::from_le_bytes([raw[4], raw[5]]),
            status2: raw[6],
        }
    }

    /// Collision count, bits 16..=19 of the vector.
    pub fn collision_count(&self) -> u8 {
        (self.status1 & 0x0f) as u8
    }

    pub fn late_collision(&self) -> bool {
        // bit 29 of the vector, bit 13 of status1
        self.status1 & (1 << 13) != 0
    }

    pub fn excessive_collision(&self) -> bool {
        self.status1 & (1 << 12) != 0
    }

    pub fn transmit_underrun(&self) -> bool {
        self.status1 & (1 << 15) != 0
    }
}
