// Copyright (C) 2019  Nexell Co., Ltd.
//
// This file is part of the nx-btc08 mining driver.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! BTC08 command set and register layouts
//!
//! A command frame is `{opcode, chip_id, parameters, response room, dummy}`
//! padded to 4 bytes. Chip id 0 broadcasts; response bytes of an addressed
//! command start right after the parameters in the received buffer and carry
//! the reply of the addressed chip (for broadcasts, of the last chip in the
//! chain).

use crate::error::{self, ErrorKind};

use byteorder::{BigEndian, ByteOrder};
use lazy_static::lazy_static;

use packed_struct::prelude::*;
use packed_struct_codegen::PackedStruct;
use packed_struct_codegen::PrimitiveEnum_u8;

/// Opcode and chip id prefix of every frame
pub const CMD_CHIP_ID_LEN: usize = 2;

/// Trailing clock stretch so the last response bits reach the host
pub const DUMMY_BYTES: usize = 2;

/// Chip id 0 addresses every chip in the chain
pub const BCAST_CHIP_ID: u8 = 0;

pub const MIDSTATE_LEN: usize = 32;

/// MerkleRoot tail + ntime + nbits
pub const DATA_LEN: usize = 12;

/// AsicBoost runs four core sets on different version words
pub const ASIC_BOOST_CORE_NUM: usize = 4;

/// WRITE_PARM payload: midstate0 + data + midstate1..3
pub const WRITE_JOB_LEN: usize = ASIC_BOOST_CORE_NUM * MIDSTATE_LEN + DATA_LEN;

pub const DISABLE_LEN: usize = 32;
pub const NONCE_LEN: usize = 4;
pub const TARGET_LEN: usize = 6;
pub const PLL_VALUE_LEN: usize = 2;
pub const JOB_ID_LEN: usize = 2;
pub const BIST_HASH_LEN: usize = 1024 / 8;

pub const RET_AUTO_ADDRESS_LEN: usize = 2;
pub const RET_READ_ID_LEN: usize = 4;
pub const RET_READ_JOB_ID_LEN: usize = 4;
pub const RET_READ_RESULT_LEN: usize = 18;
pub const RET_READ_HASH_LEN: usize = 128;
pub const RET_READ_PLL_LEN: usize = 4;
pub const RET_READ_BIST_LEN: usize = 2;
pub const RET_READ_FEATURE_LEN: usize = 4;
pub const RET_READ_REVISION_LEN: usize = 4;

/// RUN_JOB extra bit enabling the multi-midstate core sets
pub const ASIC_BOOST_EN: u8 = 1 << 1;

pub const BIST_STATUS_BUSY: u8 = 1;

/// Command opcodes as latched by the chip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    ReadId = 0x00,
    AutoAddress = 0x01,
    RunBist = 0x02,
    ReadBist = 0x03,
    Reset = 0x04,
    SetPllConfig = 0x05,
    ReadPll = 0x06,
    WriteParm = 0x07,
    ReadParm = 0x08,
    WriteTarget = 0x09,
    ReadTarget = 0x0a,
    RunJob = 0x0b,
    ReadJobId = 0x0c,
    ReadResult = 0x0d,
    ClearOon = 0x0e,
    SetDisable = 0x10,
    ReadDisable = 0x11,
    SetControl = 0x12,
    Debug = 0x15,
    WriteNonce = 0x16,
    WriteCoreCfg = 0x17,
    ReadDebugCnt = 0x19,
    ReadHash = 0x20,
    WriteIoCtrl = 0x30,
    ReadIoCtrl = 0x31,
    ReadFeature = 0x32,
    ReadRevision = 0x33,
    SetPllFoutEn = 0x34,
    SetPllResetb = 0x35,
    WriteCoreDepth = 0x36,
    SetTmode = 0x38,
}

impl Command {
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Enum representing chip address
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChipAddress {
    All,
    /// Chip ids run 1..=N along the chain
    One(u8),
}

impl ChipAddress {
    /// Return if address is a broadcast
    pub fn is_broadcast(&self) -> bool {
        match self {
            ChipAddress::All => true,
            ChipAddress::One(_) => false,
        }
    }

    /// Return wire chip address, 0 for broadcast
    pub fn to_wire(&self) -> u8 {
        match self {
            ChipAddress::All => BCAST_CHIP_ID,
            ChipAddress::One(x) => *x,
        }
    }
}

/// Frame lengths are rounded up to the 4-byte bus granularity
#[inline]
pub fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Build one command frame. The caller reserves `resp_len` bytes of room so
/// the chip can shift its reply out while the clock keeps running.
pub fn make_frame(cmd: Command, addr: ChipAddress, params: &[u8], resp_len: usize) -> Vec<u8> {
    let tx_len = align4(CMD_CHIP_ID_LEN + params.len() + resp_len + DUMMY_BYTES);
    let mut tx = vec![0u8; tx_len];
    tx[0] = cmd.code();
    tx[1] = addr.to_wire();
    tx[2..2 + params.len()].copy_from_slice(params);
    tx
}

/// Response bytes start right behind the echoed command header
#[inline]
pub fn resp_offset(parm_len: usize) -> usize {
    CMD_CHIP_ID_LEN + parm_len
}

/// AUTO_ADDRESS reply: the opcode echo followed by the chip count.
/// `None` when the chain did not echo the opcode back.
pub fn parse_auto_address(resp: &[u8]) -> Option<u8> {
    if resp[0] != Command::AutoAddress.code() {
        return None;
    }
    Some(resp[1])
}

/// READ_ID reply of one chip
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChipIdResp {
    /// Jobs sitting in the chip's input FIFO
    pub pending_jobs: u8,
    /// The chip echoes its own id; a mismatch means the chip is gone
    pub chip_id: u8,
}

impl ChipIdResp {
    pub fn from_resp(resp: &[u8]) -> Self {
        Self {
            pending_jobs: resp[2] & 0x07,
            chip_id: resp[3],
        }
    }
}

/// READ_JOB_ID reply: interrupt status of the signalling chip
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobStatus {
    pub oon_job_id: u8,
    pub gn_job_id: u8,
    pub gn_irq: bool,
    pub oon_irq: bool,
    pub fifo_full: bool,
    pub chip_id: u8,
}

impl JobStatus {
    pub fn from_resp(resp: &[u8]) -> Self {
        Self {
            oon_job_id: resp[0],
            gn_job_id: resp[1],
            gn_irq: resp[2] & (1 << 0) != 0,
            oon_irq: resp[2] & (1 << 1) != 0,
            fifo_full: resp[2] & (1 << 2) != 0,
            chip_id: resp[3],
        }
    }
}

/// The chain reports an empty result queue either with an all-ones word or
/// with both interrupt flags clear
pub fn gn_queue_empty(resp: &[u8]) -> bool {
    resp[..4] == [0xff; 4] || resp[2] & 0x03 == 0
}

/// READ_BIST reply
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BistStatus {
    pub busy: bool,
    /// Cores that hashed the golden input correctly
    pub cores: u8,
}

impl BistStatus {
    pub fn from_resp(resp: &[u8]) -> Self {
        Self {
            busy: resp[0] & 1 == BIST_STATUS_BUSY,
            cores: resp[1],
        }
    }
}

/// READ_RESULT reply: one nonce candidate per AsicBoost core set plus the
/// bitmap naming the sets that produced it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NonceResult {
    pub nonces: [u32; ASIC_BOOST_CORE_NUM],
    pub micro_job_id: u8,
}

impl NonceResult {
    pub fn from_resp(resp: &[u8]) -> Self {
        let mut nonces = [0u32; ASIC_BOOST_CORE_NUM];
        for (i, nonce) in nonces.iter_mut().enumerate() {
            *nonce = BigEndian::read_u32(&resp[i * NONCE_LEN..(i + 1) * NONCE_LEN]);
        }
        Self {
            nonces,
            micro_job_id: resp[RET_READ_RESULT_LEN - 1] & 0x0f,
        }
    }
}

/// READ_PLL reply; `None` when the chain did not echo the opcode
pub fn parse_pll_locked(resp: &[u8]) -> Option<bool> {
    if resp[1] != Command::ReadPll.code() {
        return None;
    }
    Some(resp[2] & (1 << 7) != 0)
}

/// Chip registers travel the bus as big-endian 32-bit words. Everything
/// with a 4-byte packed layout converts to and from that wire form.
pub trait RegisterWord: Sized {
    fn from_word(word: u32) -> Result<Self, PackingError>;
    fn to_word(&self) -> u32;
}

impl<T> RegisterWord for T
where
    T: PackedStruct<[u8; 4]>,
{
    fn from_word(word: u32) -> Result<Self, PackingError> {
        Self::unpack(&word.to_be_bytes())
    }

    fn to_word(&self) -> u32 {
        u32::from_be_bytes(self.pack())
    }
}

/// Hardware flavor reported in the feature word
#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, PartialEq)]
pub enum HwType {
    Fpga = 0x0,
    Asic = 0x5,
}

/// READ_FEATURE register: flavor nibble and the core pipeline depth
#[derive(PackedStruct, Debug, Clone, PartialEq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct FeatureReg {
    #[packed_field(bits = "11:8", ty = "enum")]
    pub hw_type: HwType,
    #[packed_field(bits = "7:0")]
    pub hash_depth: u8,
}

/// READ_REVISION register: mask date and index
#[derive(PackedStruct, Debug, Clone, Copy, PartialEq)]
#[packed_struct(endian = "msb")]
pub struct RevisionReg {
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub index: u8,
}

/// PLL control word (PMS divider plus mode bits)
#[derive(PackedStruct, Debug, Clone, PartialEq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct PllReg {
    #[packed_field(bits = "5:0")]
    p: Integer<u8, packed_bits::Bits6>,
    #[packed_field(bits = "15:6")]
    m: Integer<u16, packed_bits::Bits10>,
    #[packed_field(bits = "18:16")]
    s: Integer<u8, packed_bits::Bits3>,
    #[packed_field(bits = "19")]
    bypass: bool,
    #[packed_field(bits = "20")]
    div_sel: bool,
    #[packed_field(bits = "21")]
    afc_enb: bool,
    #[packed_field(bits = "26:22")]
    extafc: Integer<u8, packed_bits::Bits5>,
    #[packed_field(bits = "27")]
    feed_en: bool,
    #[packed_field(bits = "28")]
    fsel: bool,
}

impl PllReg {
    /// All table entries run with the divider output selected and automatic
    /// frequency calibration off
    fn new(p: u8, m: u16, s: u8, bypass: bool) -> Self {
        Self {
            p: p.into(),
            m: m.into(),
            s: s.into(),
            bypass,
            div_sel: true,
            afc_enb: false,
            extafc: 0.into(),
            feed_en: false,
            fsel: false,
        }
    }
}

/// One row of the canonical frequency table
pub struct PllEntry {
    /// Output frequency in MHz
    pub freq: u64,
    pub reg: PllReg,
}

lazy_static! {
    /// Canonical PLL settings, ascending. The first row bypasses the PLL and
    /// runs the chips straight off the reference clock.
    pub static ref PLL_TABLE: [PllEntry; 21] = [
        PllEntry { freq: 24, reg: PllReg::new(6, 600, 2, true) },
        PllEntry { freq: 50, reg: PllReg::new(6, 200, 3, false) },
        PllEntry { freq: 100, reg: PllReg::new(6, 200, 2, false) },
        PllEntry { freq: 150, reg: PllReg::new(6, 300, 2, false) },
        PllEntry { freq: 200, reg: PllReg::new(6, 400, 2, false) },
        PllEntry { freq: 250, reg: PllReg::new(6, 500, 2, false) },
        PllEntry { freq: 300, reg: PllReg::new(6, 600, 2, false) },
        PllEntry { freq: 350, reg: PllReg::new(6, 700, 2, false) },
        PllEntry { freq: 400, reg: PllReg::new(6, 400, 1, false) },
        PllEntry { freq: 450, reg: PllReg::new(6, 450, 1, false) },
        PllEntry { freq: 500, reg: PllReg::new(6, 500, 1, false) },
        PllEntry { freq: 550, reg: PllReg::new(6, 550, 1, false) },
        PllEntry { freq: 600, reg: PllReg::new(6, 600, 1, false) },
        PllEntry { freq: 650, reg: PllReg::new(6, 650, 1, false) },
        PllEntry { freq: 700, reg: PllReg::new(6, 700, 1, false) },
        PllEntry { freq: 750, reg: PllReg::new(6, 750, 1, false) },
        PllEntry { freq: 800, reg: PllReg::new(6, 800, 1, false) },
        PllEntry { freq: 850, reg: PllReg::new(6, 425, 0, false) },
        PllEntry { freq: 900, reg: PllReg::new(6, 450, 0, false) },
        PllEntry { freq: 950, reg: PllReg::new(6, 475, 0, false) },
        PllEntry { freq: 1000, reg: PllReg::new(6, 500, 0, false) },
    ];
}

/// Lowest frequency the supervisor may step a chip down to
pub fn pll_min_freq() -> u64 {
    PLL_TABLE[1].freq
}

/// Select the smallest table entry satisfying `freq`, clamped to the top row
pub fn pll_lookup(freq: u64) -> error::Result<&'static PllEntry> {
    if freq < PLL_TABLE[0].freq {
        Err(ErrorKind::Pll(format!(
            "requested {} MHz is below the table minimum of {} MHz",
            freq, PLL_TABLE[0].freq
        )))?
    }
    Ok(PLL_TABLE
        .iter()
        .find(|entry| freq <= entry.freq)
        .unwrap_or(&PLL_TABLE[PLL_TABLE.len() - 1]))
}

/// Derive the compact difficulty encoding from a big-endian 32-byte target.
/// Returns 0 for an all-zero target.
pub fn nbits_from_target(target: &[u8; 32]) -> u32 {
    let mut top = 0;
    while top < 32 && target[top] == 0 {
        top += 1;
    }
    if top == 32 {
        return 0;
    }
    let at = |i: usize| if i < 32 { u32::from(target[i]) } else { 0 };
    let size = (32 - top) as u32;
    if at(top + 2) == 0 {
        // shift the mantissa down a byte, as the chip expects
        ((size + 1) << 24) | (at(top) << 8) | at(top + 1)
    } else {
        (size << 24) | (at(top) << 16) | (at(top + 1) << 8) | at(top + 2)
    }
}

/// WRITE_TARGET payload: big-endian nBits followed by the two core select
/// bytes derived from the nBits size
pub fn encode_target(target: &[u8; 32]) -> [u8; TARGET_LEN] {
    let nbits = nbits_from_target(target);
    let mut out = [0u8; TARGET_LEN];
    BigEndian::write_u32(&mut out[0..4], nbits);
    let msb = (nbits >> 24) as u8;
    if msb >= 2 {
        out[4] = ((msb - 1) >> 2) - 1;
        out[5] = (((msb - 1) & 3) + 1) << 4;
    }
    out
}

/// WRITE_NONCE payload: big-endian sub-range bounds, both inclusive
pub fn encode_nonce_range(start_nonce: u32, end_nonce: u32) -> [u8; NONCE_LEN * 2] {
    let mut out = [0u8; NONCE_LEN * 2];
    BigEndian::write_u32(&mut out[0..4], start_nonce);
    BigEndian::write_u32(&mut out[4..8], end_nonce);
    out
}

/// Golden job parameters hashed by every core during BIST
pub const GOLDEN_PARAM: [u8; WRITE_JOB_LEN] = [
    0x5f, 0x4d, 0x60, 0xa2, 0x53, 0x85, 0xc4, 0x07, 0xc2, 0xa8, 0x4e, 0x0c, 0x25, 0x91, 0x69,
    0xc4, 0x10, 0xa4, 0xa5, 0x4b, 0x93, 0xf7, 0x17, 0x08, 0xf1, 0xab, 0xdf, 0xec, 0x6e, 0x8b,
    0x81, 0xd2, //
    0xf4, 0x2a, 0x1d, 0x6e, 0x5b, 0x30, 0x70, 0x7e, 0x17, 0x37, 0x6f, 0x56, //
    0x5f, 0x4d, 0x60, 0xa2, 0x53, 0x85, 0xc4, 0x07, 0xc2, 0xa8, 0x4e, 0x0c, 0x25, 0x91, 0x69,
    0xc4, 0x10, 0xa4, 0xa5, 0x4b, 0x93, 0xf7, 0x17, 0x08, 0xf1, 0xab, 0xdf, 0xec, 0x6e, 0x8b,
    0x81, 0xd2, //
    0x5f, 0x4d, 0x60, 0xa2, 0x53, 0x85, 0xc4, 0x07, 0xc2, 0xa8, 0x4e, 0x0c, 0x25, 0x91, 0x69,
    0xc4, 0x10, 0xa4, 0xa5, 0x4b, 0x93, 0xf7, 0x17, 0x08, 0xf1, 0xab, 0xdf, 0xec, 0x6e, 0x8b,
    0x81, 0xd2, //
    0x5f, 0x4d, 0x60, 0xa2, 0x53, 0x85, 0xc4, 0x07, 0xc2, 0xa8, 0x4e, 0x0c, 0x25, 0x91, 0x69,
    0xc4, 0x10, 0xa4, 0xa5, 0x4b, 0x93, 0xf7, 0x17, 0x08, 0xf1, 0xab, 0xdf, 0xec, 0x6e, 0x8b,
    0x81, 0xd2,
];

/// Golden nonce pair loaded with WRITE_NONCE before BIST
pub const GOLDEN_NONCE: [u8; NONCE_LEN * 2] = [0x66, 0xcb, 0x34, 0x26, 0x66, 0xcb, 0x34, 0x26];

/// Expected digest of the golden input, replicated per core set
pub const GOLDEN_HASH: [u8; BIST_HASH_LEN] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x22, 0x09, 0x3d, 0xd4, 0x38, 0xed,
    0x47, 0xfa, 0x28, 0xe7, 0x18, 0x58, 0xb8, 0x22, 0x0d, 0x53, 0xe5, 0xcd, 0x83, 0xb8, 0xd0,
    0xd4, 0x42, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x22, 0x09, 0x3d, 0xd4, 0x38, 0xed,
    0x47, 0xfa, 0x28, 0xe7, 0x18, 0x58, 0xb8, 0x22, 0x0d, 0x53, 0xe5, 0xcd, 0x83, 0xb8, 0xd0,
    0xd4, 0x42, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x22, 0x09, 0x3d, 0xd4, 0x38, 0xed,
    0x47, 0xfa, 0x28, 0xe7, 0x18, 0x58, 0xb8, 0x22, 0x0d, 0x53, 0xe5, 0xcd, 0x83, 0xb8, 0xd0,
    0xd4, 0x42, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x22, 0x09, 0x3d, 0xd4, 0x38, 0xed,
    0x47, 0xfa, 0x28, 0xe7, 0x18, 0x58, 0xb8, 0x22, 0x0d, 0x53, 0xe5, 0xcd, 0x83, 0xb8, 0xd0,
    0xd4, 0x42,
];

/// Target matching the golden input
pub const GOLDEN_TARGET: [u8; TARGET_LEN] = [0x17, 0x37, 0x6f, 0x56, 0x05, 0x00];

/// Core disable mask used for BIST: all cores enabled
pub const GOLDEN_DISABLE: [u8; DISABLE_LEN] = [0u8; DISABLE_LEN];

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_chip_address() {
        let all = ChipAddress::All;
        assert!(all.is_broadcast());
        assert_eq!(all.to_wire(), 0);

        let one = ChipAddress::One(9);
        assert!(!one.is_broadcast());
        assert_eq!(one.to_wire(), 9);
    }

    #[test]
    fn test_align4() {
        assert_eq!(align4(0), 0);
        assert_eq!(align4(1), 4);
        assert_eq!(align4(4), 4);
        assert_eq!(align4(38), 40);
        assert_eq!(align4(144), 144);
    }

    /// READ_ID of chip 3 reserves 4 response bytes and pads to 8
    #[test]
    fn test_build_read_id_frame() {
        let tx = make_frame(Command::ReadId, ChipAddress::One(3), &[], RET_READ_ID_LEN);
        assert_eq!(tx, vec![0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(resp_offset(0), 2);
    }

    /// AUTO_ADDRESS pushes 32 dummy parameter bytes through the chain
    #[test]
    fn test_build_auto_address_frame() {
        let tx = make_frame(
            Command::AutoAddress,
            ChipAddress::All,
            &[0u8; 32],
            RET_AUTO_ADDRESS_LEN,
        );
        assert_eq!(tx.len(), 40);
        assert_eq!(tx[0], 0x01);
        assert_eq!(tx[1], BCAST_CHIP_ID);
        assert_eq!(resp_offset(32), 34);
    }

    #[test]
    fn test_build_run_job_frame() {
        let tx = make_frame(
            Command::RunJob,
            ChipAddress::All,
            &[ASIC_BOOST_EN, 5],
            0,
        );
        assert_eq!(tx, vec![0x0b, 0x00, 0x02, 0x05, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_parse_auto_address() {
        assert_eq!(parse_auto_address(&[0x01, 22]), Some(22));
        assert_eq!(parse_auto_address(&[0x00, 22]), None);
    }

    #[test]
    fn test_parse_chip_id() {
        let resp = ChipIdResp::from_resp(&[0x00, 0x00, 0xfa, 0x07]);
        assert_eq!(resp.pending_jobs, 2);
        assert_eq!(resp.chip_id, 7);
    }

    #[test]
    fn test_parse_job_status() {
        let status = JobStatus::from_resp(&[0x02, 0x03, 0x01, 0x01]);
        assert_eq!(status.oon_job_id, 2);
        assert_eq!(status.gn_job_id, 3);
        assert!(status.gn_irq);
        assert!(!status.oon_irq);
        assert!(!status.fifo_full);
        assert_eq!(status.chip_id, 1);
    }

    #[test]
    fn test_gn_queue_empty() {
        assert!(gn_queue_empty(&[0xff, 0xff, 0xff, 0xff]));
        assert!(gn_queue_empty(&[0x00, 0x00, 0x00, 0x00]));
        assert!(gn_queue_empty(&[0x01, 0x02, 0x04, 0x03]));
        assert!(!gn_queue_empty(&[0x00, 0x03, 0x01, 0x01]));
        assert!(!gn_queue_empty(&[0x03, 0x00, 0x02, 0x01]));
    }

    #[test]
    fn test_parse_bist_status() {
        let busy = BistStatus::from_resp(&[0x01, 0x00]);
        assert!(busy.busy);
        let done = BistStatus::from_resp(&[0x00, 0xce]);
        assert!(!done.busy);
        assert_eq!(done.cores, 206);
    }

    #[test]
    fn test_parse_nonce_result() {
        let mut resp = [0u8; RET_READ_RESULT_LEN];
        resp[0..4].copy_from_slice(&[0x66, 0xcb, 0x34, 0x26]);
        resp[4..8].copy_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        resp[17] = 0x01;
        let result = NonceResult::from_resp(&resp);
        assert_eq!(result.nonces[0], 0x66cb3426);
        assert_eq!(result.nonces[1], 1);
        assert_eq!(result.nonces[2], 0);
        assert_eq!(result.micro_job_id, 0x01);
    }

    #[test]
    fn test_parse_pll_locked() {
        assert_eq!(parse_pll_locked(&[0x00, 0x06, 0x80, 0x00]), Some(true));
        assert_eq!(parse_pll_locked(&[0x00, 0x06, 0x7f, 0x00]), Some(false));
        assert_eq!(parse_pll_locked(&[0x00, 0x00, 0x80, 0x00]), None);
    }

    #[test]
    fn test_feature_reg() {
        let reg = FeatureReg::from_word(0x0000_0512).expect("feature unpacking failed");
        assert_eq!(reg.hw_type, HwType::Asic);
        assert_eq!(reg.hash_depth, 0x12);

        let reg = FeatureReg::from_word(0x0000_0040).expect("feature unpacking failed");
        assert_eq!(reg.hw_type, HwType::Fpga);
        assert_eq!(reg.hash_depth, 0x40);
    }

    #[test]
    fn test_broken_feature_reg() {
        // feature nibble 0x3 names no known hardware flavor
        assert!(FeatureReg::from_word(0x0000_0312).is_err());
    }

    #[test]
    fn test_revision_reg() {
        let reg = RevisionReg::unpack(&[0x20, 0x01, 0x15, 0x02]).expect("unpacking failed");
        assert_eq!(reg.year, 0x20);
        assert_eq!(reg.month, 0x01);
        assert_eq!(reg.day, 0x15);
        assert_eq!(reg.index, 0x02);
    }

    /// Spot-check PLL control words against the vendor table
    fn try_one_pll(freq: u64, reg: u32) {
        let entry = pll_lookup(freq).expect("frequency not in table");
        assert_eq!(entry.freq, freq);
        assert_eq!(
            entry.reg.to_word(),
            reg,
            "PLL word for {} MHz: {:#010x} expected {:#010x}",
            freq,
            entry.reg.to_word(),
            reg
        );
    }

    #[test]
    fn test_pll_words() {
        try_one_pll(24, 0x001a_9606);
        try_one_pll(300, 0x0012_9606);
        try_one_pll(550, 0x0011_8986);
        try_one_pll(850, 0x0010_6a46);
        try_one_pll(1000, 0x0010_7d06);
    }

    #[test]
    fn test_pll_lookup() {
        // exact hits and the round-up rule
        assert_eq!(pll_lookup(550).unwrap().freq, 550);
        assert_eq!(pll_lookup(551).unwrap().freq, 600);
        assert_eq!(pll_lookup(25).unwrap().freq, 50);
        // clamped to the table maximum
        assert_eq!(pll_lookup(1200).unwrap().freq, 1000);
        // below the bypass row
        assert!(pll_lookup(10).is_err());
        assert_eq!(pll_min_freq(), 50);
    }

    #[test]
    fn test_pll_table_ascending() {
        for pair in PLL_TABLE.windows(2) {
            assert!(pair[0].freq < pair[1].freq);
        }
    }

    fn diff1_target() -> [u8; 32] {
        let mut target = [0u8; 32];
        target[4] = 0xff;
        target[5] = 0xff;
        target
    }

    #[test]
    fn test_nbits_from_target() {
        assert_eq!(nbits_from_target(&diff1_target()), 0x1d00ffff);

        let mut target = [0xffu8; 32];
        target[0] = 0;
        assert_eq!(nbits_from_target(&target), 0x1fffffff);

        assert_eq!(nbits_from_target(&[0u8; 32]), 0);
    }

    /// The select bytes must match the original driver's on-wire targets
    #[test]
    fn test_encode_target() {
        assert_eq!(
            encode_target(&diff1_target()),
            [0x1d, 0x00, 0xff, 0xff, 0x06, 0x10]
        );

        let mut target = [0xffu8; 32];
        target[0] = 0;
        assert_eq!(
            encode_target(&target),
            [0x1f, 0xff, 0xff, 0xff, 0x06, 0x30]
        );
    }

    #[test]
    fn test_encode_nonce_range() {
        assert_eq!(
            encode_nonce_range(0x01020304, 0xa0b0c0d0),
            [0x01, 0x02, 0x03, 0x04, 0xa0, 0xb0, 0xc0, 0xd0]
        );
    }

    #[test]
    fn test_golden_vector_sizes() {
        assert_eq!(GOLDEN_PARAM.len(), 140);
        assert_eq!(GOLDEN_HASH.len(), 128);
        assert_eq!(GOLDEN_NONCE.len(), 8);
        assert_eq!(GOLDEN_TARGET.len(), 6);
    }
}
