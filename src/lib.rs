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

pub mod btc08;
pub mod config;
pub mod error;
pub mod gpio;
pub mod hal;
pub mod io;
pub mod logging;
pub mod null_work;
pub mod power;
pub mod registry;
pub mod spi;


use crate::btc08::{ChipAddress, Command};
use crate::error::{ErrorKind, Result};
use crate::logging::macros::*;

use byteorder::{BigEndian, ByteOrder};
use embedded_hal::digital::v2::{InputPin, OutputPin};
use failure::ResultExt;
use futures::lock::Mutex;
use tokio::time::{sleep, Instant};

use std::sync::Arc;
use std::time::Duration;

/// RESET line must stay low at least this long to take effect
const RESET_PULSE_MS: u64 = 1;

/// PLL lock polling: 25 x 40 ms
const PLL_LOCK_RETRIES: usize = 25;
const PLL_LOCK_WAIT_MS: u64 = 40;

/// BIST completion polling: 10 x 200 ms
const BIST_RETRIES: usize = 10;
const BIST_WAIT_MS: u64 = 200;

/// Pause between GN/OON level polls inside the scan loop
const GN_POLL_SLEEP_MS: u64 = 1;

/// Dummy transfer length used to resynchronise a confused chain
const FLUSH_FRAME_LEN: usize = 64;

/// The supervisor steps an overloaded chip down by this much
const PLL_STEP_DOWN_MHZ: u64 = 50;

/// Interrupt lines shared by all chips of a chain
#[derive(Debug, Clone, Copy)]
enum Line {
    Gn,
    Oon,
}

/// Per-chip state discovered at enumeration and updated while mining
#[derive(Debug, Clone)]
pub struct Chip {
    pub num_cores: usize,
    pub hash_depth: u8,
    pub hw_type: btc08::HwType,
    pub revision: Option<btc08::RevisionReg>,
    /// Programmed frequency; zero means the chip is out of the rotation
    pub mhz: u64,
    /// cores x MHz, the chip's share weight for nonce-range distribution
    pub perf: u64,
    pub start_nonce: u32,
    pub end_nonce: u32,
    /// Marked broken, never re-enabled
    pub disabled: bool,
    /// When the chip was last taken out of service
    pub cooldown_begin: Option<Instant>,
    pub fail_count: usize,
    pub nonces_found: usize,
    pub hw_errors: usize,
    pub stales: usize,
    pub nonce_ranges_done: usize,
}

impl Chip {
    fn new() -> Self {
        Self {
            num_cores: 0,
            hash_depth: 0,
            hw_type: btc08::HwType::Asic,
            revision: None,
            mhz: 0,
            perf: 0,
            start_nonce: 0,
            end_nonce: 0,
            disabled: false,
            cooldown_begin: None,
            fail_count: 0,
            nonces_found: 0,
            hw_errors: 0,
            stales: 0,
            nonce_ranges_done: 0,
        }
    }

    /// Once a chip lands in cooldown it stays out; there is no re-enable path
    pub fn is_disabled(&self) -> bool {
        self.disabled || self.cooldown_begin.is_some()
    }

    fn is_active(&self) -> bool {
        !self.is_disabled() && self.perf > 0
    }

    fn take_out(&mut self, now: Instant) {
        self.disabled = true;
        self.cooldown_begin = Some(now);
        self.fail_count += 1;
        self.num_cores = 0;
        self.mhz = 0;
        self.perf = 0;
    }
}

/// Driver of one BTC08 chain hanging off an SPI bus.
///
/// All chips share the bus and the two interrupt level lines; commands are
/// daisy-chained through every chip, which is why responses echo the opcode
/// and why dead chips cut off everything behind them.
pub struct HashChain<T: io::Interface> {
    chain_id: usize,
    io: T,
    power: Option<power::Control>,
    opts: config::Options,
    /// Physical chip inventory in enumeration order. Logical index `i` maps
    /// to wire chip id `i - last_chip + 1`; the mapping moves only when the
    /// supervisor shortens the chain.
    chips: Vec<Chip>,
    /// Count of leading chips cut off the chain
    last_chip: usize,
    num_cores: usize,
    perf: u64,
    sdiff: f64,
    is_processing: bool,
    disabled: bool,
    registry: registry::JobRegistry,
    queue: registry::WorkQueue,
    timeout_oon: Duration,
    high_temp_val: f32,
    high_temp_id: usize,
}

impl<T: io::Interface> HashChain<T> {
    pub fn new(io: T, opts: config::Options, chain_id: usize, power: Option<power::Control>) -> Self {
        Self {
            chain_id,
            io,
            power,
            opts,
            chips: Vec::new(),
            last_chip: 0,
            num_cores: 0,
            perf: 0,
            sdiff: 0.0,
            is_processing: false,
            disabled: false,
            registry: registry::JobRegistry::new(),
            queue: registry::WorkQueue::new(),
            timeout_oon: config::TIME_LIMIT_OF_OON,
            high_temp_val: 0.0,
            high_temp_id: 0,
        }
    }

    pub fn chain_id(&self) -> usize {
        self.chain_id
    }

    pub fn chips(&self) -> &[Chip] {
        &self.chips
    }

    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    pub fn perf(&self) -> u64 {
        self.perf
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn in_flight(&self) -> usize {
        self.registry.in_flight()
    }

    /// Logical indices of chips still physically addressed
    fn live_range(&self) -> std::ops::Range<usize> {
        self.last_chip..self.chips.len()
    }

    pub fn num_active_chips(&self) -> usize {
        self.chips.len() - self.last_chip
    }

    /// Wire chip id of a logical chip index
    fn chip_id_of(&self, index: usize) -> u8 {
        debug_assert!(index >= self.last_chip);
        (index - self.last_chip + 1) as u8
    }

    /// Logical chip index behind a wire chip id
    fn index_of(&self, chip_id: u8) -> usize {
        chip_id as usize - 1 + self.last_chip
    }

    /// The chain flavor is read off the last enumerated chip
    fn is_fpga(&self) -> bool {
        self.chips
            .last()
            .map(|chip| chip.hw_type == btc08::HwType::Fpga)
            .unwrap_or(false)
    }

    /* ---------------- command layer ---------------- */

    fn exec_cmd(
        &mut self,
        cmd: Command,
        addr: ChipAddress,
        params: &[u8],
        resp_len: usize,
    ) -> Result<Vec<u8>> {
        let tx = btc08::make_frame(cmd, addr, params, resp_len);
        let rx = match self.io.transfer(&tx) {
            Ok(rx) => rx,
            Err(e) => {
                self.disabled = true;
                error!("{}: {:?} transfer failed", self.chain_id, cmd);
                return Err(e);
            }
        };
        Ok(rx[btc08::resp_offset(params.len())..].to_vec())
    }

    fn exec_cmd_fast(
        &mut self,
        cmd: Command,
        addr: ChipAddress,
        params: &[u8],
        resp_len: usize,
    ) -> Result<Vec<u8>> {
        let tx = btc08::make_frame(cmd, addr, params, resp_len);
        let rx = match self.io.transfer_fast(&tx) {
            Ok(rx) => rx,
            Err(e) => {
                self.disabled = true;
                error!("{}: {:?} fast transfer failed", self.chain_id, cmd);
                return Err(e);
            }
        };
        Ok(rx[btc08::resp_offset(params.len())..].to_vec())
    }

    fn cmd_reset_bcast(&mut self) -> Result<()> {
        self.exec_cmd(Command::Reset, ChipAddress::All, &[], 0)?;
        info!("{}: RESET broadcast", self.chain_id);
        Ok(())
    }

    fn cmd_auto_address(&mut self) -> Result<u8> {
        let dummy = [0u8; 32];
        let resp = self.exec_cmd(
            Command::AutoAddress,
            ChipAddress::All,
            &dummy,
            btc08::RET_AUTO_ADDRESS_LEN,
        )?;
        btc08::parse_auto_address(&resp).ok_or_else(|| {
            warn!("{}: error in AUTO_ADDRESS", self.chain_id);
            ErrorKind::Framing("AUTO_ADDRESS echo mismatch".to_string()).into()
        })
    }

    /// READ_ID; `None` when the chip does not echo its own address back
    fn cmd_read_id(&mut self, chip_id: u8) -> Result<Option<btc08::ChipIdResp>> {
        let resp = self.exec_cmd(
            Command::ReadId,
            ChipAddress::One(chip_id),
            &[],
            btc08::RET_READ_ID_LEN,
        )?;
        let id = btc08::ChipIdResp::from_resp(&resp);
        if id.chip_id != chip_id {
            warn!(
                "{}: error in READ_ID({}; {})",
                self.chain_id, chip_id, id.chip_id
            );
            return Ok(None);
        }
        Ok(Some(id))
    }

    fn cmd_read_feature(&mut self, chip_id: u8) -> Result<(btc08::FeatureReg, u32)> {
        use crate::btc08::RegisterWord;
        let resp = self.exec_cmd(
            Command::ReadFeature,
            ChipAddress::One(chip_id),
            &[],
            btc08::RET_READ_FEATURE_LEN,
        )?;
        let word = BigEndian::read_u32(&resp[0..4]);
        let reg = btc08::FeatureReg::from_word(word)
            .context(format!("feature register unpacking failed ({:#010x})", word))?;
        Ok((reg, word))
    }

    fn cmd_read_revision(&mut self, chip_id: u8) -> Result<btc08::RevisionReg> {
        use packed_struct::PackedStructSlice;
        let resp = self.exec_cmd(
            Command::ReadRevision,
            ChipAddress::One(chip_id),
            &[],
            btc08::RET_READ_REVISION_LEN,
        )?;
        let reg = btc08::RevisionReg::unpack_from_slice(&resp[0..4])
            .context("revision register unpacking failed".to_string())?;
        Ok(reg)
    }

    fn cmd_read_bist(&mut self, chip_id: u8) -> Result<btc08::BistStatus> {
        let resp = self.exec_cmd(
            Command::ReadBist,
            ChipAddress::One(chip_id),
            &[],
            btc08::RET_READ_BIST_LEN,
        )?;
        Ok(btc08::BistStatus::from_resp(&resp))
    }

    fn cmd_set_control(&mut self, addr: ChipAddress, value: u32) -> Result<()> {
        let mut params = [0u8; 4];
        BigEndian::write_u32(&mut params, value);
        self.exec_cmd(Command::SetControl, addr, &params, 0)?;
        Ok(())
    }

    fn cmd_set_pll_config(&mut self, addr: ChipAddress, reg: &btc08::PllReg) -> Result<()> {
        use crate::btc08::RegisterWord;
        let mut params = [0u8; 4];
        BigEndian::write_u32(&mut params, reg.to_word());
        self.exec_cmd(Command::SetPllConfig, addr, &params, 0)?;
        Ok(())
    }

    fn cmd_set_pll_fout_en(&mut self, addr: ChipAddress, enable: bool) -> Result<()> {
        let params = [0u8, enable as u8];
        self.exec_cmd(Command::SetPllFoutEn, addr, &params, 0)?;
        Ok(())
    }

    fn cmd_set_pll_resetb(&mut self, addr: ChipAddress, level: bool) -> Result<()> {
        let params = [0u8, level as u8];
        self.exec_cmd(Command::SetPllResetb, addr, &params, 0)?;
        Ok(())
    }

    /// READ_PLL lock poll; `None` when the response is garbled
    fn cmd_read_pll(&mut self, chip_id: u8) -> Result<Option<bool>> {
        let resp = self.exec_cmd(
            Command::ReadPll,
            ChipAddress::One(chip_id),
            &[],
            btc08::RET_READ_PLL_LEN,
        )?;
        Ok(btc08::parse_pll_locked(&resp))
    }

    fn cmd_write_nonce(&mut self, chip_id: u8, start_nonce: u32, end_nonce: u32) -> Result<()> {
        let params = btc08::encode_nonce_range(start_nonce, end_nonce);
        self.exec_cmd(Command::WriteNonce, ChipAddress::One(chip_id), &params, 0)?;
        Ok(())
    }

    fn cmd_clear_oon_bcast(&mut self) -> Result<()> {
        self.exec_cmd_fast(Command::ClearOon, ChipAddress::All, &[], 0)?;
        Ok(())
    }

    fn cmd_read_job_id_bcast(&mut self) -> Result<Vec<u8>> {
        self.exec_cmd(
            Command::ReadJobId,
            ChipAddress::All,
            &[],
            btc08::RET_READ_JOB_ID_LEN,
        )
    }

    fn cmd_read_result(&mut self, chip_id: u8) -> Result<btc08::NonceResult> {
        let resp = self.exec_cmd(
            Command::ReadResult,
            ChipAddress::One(chip_id),
            &[],
            btc08::RET_READ_RESULT_LEN,
        )?;
        Ok(btc08::NonceResult::from_resp(&resp))
    }

    /// Hash readback that goes with a golden nonce; logged, not validated
    fn cmd_read_hash(&mut self, chip_id: u8) -> Result<()> {
        let resp = self.exec_cmd(
            Command::ReadHash,
            ChipAddress::One(chip_id),
            &[],
            btc08::RET_READ_HASH_LEN,
        )?;
        trace!(
            "{}: chip {} hash: {}",
            self.chain_id,
            chip_id,
            hex::encode(&resp[0..32])
        );
        Ok(())
    }

    /// Golden-input broadcast sequence that arms the self-test
    fn cmd_bist_bcast(&mut self) -> Result<()> {
        self.exec_cmd(Command::WriteParm, ChipAddress::All, &btc08::GOLDEN_PARAM, 0)?;
        self.exec_cmd(
            Command::WriteTarget,
            ChipAddress::All,
            &btc08::GOLDEN_TARGET,
            0,
        )?;
        self.exec_cmd(
            Command::WriteNonce,
            ChipAddress::All,
            &btc08::GOLDEN_NONCE,
            0,
        )?;
        self.exec_cmd(
            Command::SetDisable,
            ChipAddress::All,
            &btc08::GOLDEN_DISABLE,
            0,
        )?;
        self.exec_cmd(Command::RunBist, ChipAddress::All, &btc08::GOLDEN_HASH, 0)?;
        Ok(())
    }

    /// An interrupt level line of the chain, polled during scan
    fn poll_line(&mut self, line: Line) -> Result<bool> {
        let level = match line {
            Line::Gn => self.io.gn_asserted(),
            Line::Oon => self.io.oon_asserted(),
        };
        level.map_err(|e| {
            self.disabled = true;
            error!("{}: {:?} line read failed", self.chain_id, line);
            e
        })
    }

    /// Push a dummy frame through to resynchronise the chain
    fn flush_spi(&mut self) -> Result<()> {
        let tx = vec![0u8; FLUSH_FRAME_LEN];
        self.io.transfer(&tx).map_err(|e| {
            self.disabled = true;
            e
        })?;
        Ok(())
    }

    /* ---------------- initialisation ---------------- */

    async fn reset_pulse(&mut self) -> Result<()> {
        if let Err(e) = self.io.set_reset(false) {
            self.disabled = true;
            return Err(e);
        }
        sleep(Duration::from_millis(RESET_PULSE_MS)).await;
        if let Err(e) = self.io.set_reset(true) {
            self.disabled = true;
            return Err(e);
        }
        Ok(())
    }

    /// Bring the chain up from scratch: hardware reset, enumeration, PLL,
    /// BIST, interrupt setup and nonce-range distribution
    pub async fn init(&mut self) -> Result<()> {
        info!("{}: initializing BTC08 chain", self.chain_id);
        self.reset_pulse().await?;
        self.cmd_reset_bcast()?;
        self.enumerate_chips()?;
        self.program_pll().await?;
        self.run_bist().await?;
        self.cmd_set_control(ChipAddress::All, config::OON_IRQ_EN | self.opts.udiv)?;
        self.assign_nonce_ranges()?;
        info!(
            "{}: found {} chips with total {} active cores",
            self.chain_id,
            self.num_active_chips(),
            self.num_cores
        );
        Ok(())
    }

    /// Detect the number of chips and verify each one answers to the address
    /// the auto-addressing pass assigned to it
    fn enumerate_chips(&mut self) -> Result<()> {
        let mut count = self.cmd_auto_address()? as usize;
        if count == 0 || count > config::MAX_CHIP_NUM {
            Err(ErrorKind::Hashchip(format!(
                "detected {} chips on chain {}",
                count, self.chain_id
            )))?
        }
        if let Some(limit) = self.opts.override_chip_num {
            count = count.min(limit);
        }

        for chip_id in (1..=count as u8).rev() {
            match self.cmd_read_id(chip_id)? {
                Some(_) => (),
                None => {
                    // partially populated chain: nothing mines until the
                    // board is fixed
                    self.chips.clear();
                    Err(ErrorKind::Framing(format!(
                        "chip {} did not echo its address",
                        chip_id
                    )))?
                }
            }
        }

        self.chips = (0..count).map(|_| Chip::new()).collect();
        self.last_chip = 0;
        self.survey_chips(count)?;

        // every chip starts at the requested clock
        for chip in self.chips.iter_mut() {
            chip.mhz = self.opts.pll;
        }

        info!("{}: detected {} chips", self.chain_id, count);
        Ok(())
    }

    /// Read feature and revision off every addressed chip and enforce the
    /// chip-count floor. Shared by first bring-up and re-init.
    fn survey_chips(&mut self, count: usize) -> Result<()> {
        for chip_id in 1..=count as u8 {
            let (feature, raw) = self.cmd_read_feature(chip_id)?;
            let revision = self.cmd_read_revision(chip_id)?;
            info!(
                "{}: chip {}: feature {:#010x} date {:02x}/{:02x}/{:02x} index {:02x}",
                self.chain_id, chip_id, raw, revision.year, revision.month, revision.day,
                revision.index
            );
            let index = self.index_of(chip_id);
            let chip = &mut self.chips[index];
            chip.hw_type = feature.hw_type;
            chip.hash_depth = feature.hash_depth;
            chip.revision = Some(revision);
        }

        if self.is_fpga() {
            self.timeout_oon = config::TIME_LIMIT_OF_OON_FPGA;
        } else {
            self.timeout_oon = config::TIME_LIMIT_OF_OON;
            if count < self.opts.min_chips {
                Err(ErrorKind::Hashboard(
                    self.chain_id,
                    format!(
                        "only {} chips, at least {} required",
                        count, self.opts.min_chips
                    ),
                ))?
            }
        }
        Ok(())
    }

    /// Chips eligible for clocking: addressed, not taken out, with a
    /// non-zero frequency target
    fn clockable_chips(&self) -> Vec<usize> {
        self.live_range()
            .filter(|&i| !self.chips[i].is_disabled() && self.chips[i].mhz > 0)
            .collect()
    }

    async fn program_pll(&mut self) -> Result<()> {
        if self.is_fpga() {
            for i in self.live_range() {
                self.chips[i].mhz = config::FPGA_MINER_CORE_CLK_MHZ;
            }
            info!("{}: FPGA flavor, skipping PLL", self.chain_id);
            return Ok(());
        }

        let chips = self.clockable_chips();
        if chips.is_empty() {
            Err(ErrorKind::Pll("no clockable chips left".to_string()))?
        }

        let first = self.chips[chips[0]].mhz;
        if chips.iter().all(|&i| self.chips[i].mhz == first) {
            // all chips ask for the same frequency: one broadcast does it
            let entry = btc08::pll_lookup(first)?;
            self.load_pll(ChipAddress::All, entry).await?;
            for &i in &chips {
                let chip_id = self.chip_id_of(i);
                let locked = self.wait_pll_lock(chip_id).await?;
                self.chips[i].mhz = if locked { entry.freq } else { 0 };
            }
        } else {
            for &i in &chips {
                let chip_id = self.chip_id_of(i);
                let entry = btc08::pll_lookup(self.chips[i].mhz)?;
                self.load_pll(ChipAddress::One(chip_id), entry).await?;
                let locked = self.wait_pll_lock(chip_id).await?;
                self.chips[i].mhz = if locked { entry.freq } else { 0 };
            }
        }

        if chips.iter().all(|&i| self.chips[i].mhz == 0) {
            Err(ErrorKind::Pll("no chip achieved lock".to_string()))?
        }
        Ok(())
    }

    /// Load one PMS word: output gated off, divider in reset while the word
    /// latches, then released and gated back on
    async fn load_pll(&mut self, addr: ChipAddress, entry: &btc08::PllEntry) -> Result<()> {
        self.cmd_set_pll_fout_en(addr, false)?;
        self.cmd_set_pll_resetb(addr, false)?;
        self.cmd_set_pll_config(addr, &entry.reg)?;
        self.cmd_set_pll_resetb(addr, true)?;
        sleep(Duration::from_millis(1)).await;
        self.cmd_set_pll_fout_en(addr, true)?;
        Ok(())
    }

    async fn wait_pll_lock(&mut self, chip_id: u8) -> Result<bool> {
        for _ in 0..PLL_LOCK_RETRIES {
            match self.cmd_read_pll(chip_id)? {
                Some(true) => {
                    debug!("{}: chip {} PLL locked", self.chain_id, chip_id);
                    return Ok(true);
                }
                Some(false) => (),
                None => {
                    warn!("{}: error in READ_PLL", self.chain_id);
                    return Ok(false);
                }
            }
            sleep(Duration::from_millis(PLL_LOCK_WAIT_MS)).await;
        }
        error!("{}: chip {} failed PLL lock", self.chain_id, chip_id);
        Ok(false)
    }

    /// Broadcast the golden job and collect the per-chip core counts
    async fn run_bist(&mut self) -> Result<()> {
        self.cmd_bist_bcast()?;
        self.num_cores = 0;
        self.perf = 0;
        for i in self.live_range() {
            if self.chips[i].is_disabled() {
                debug!("{}: chip index {} disabled, skipped", self.chain_id, i);
                continue;
            }
            self.check_chip(i).await?;
        }
        if self.perf == 0 {
            Err(ErrorKind::Hashboard(
                self.chain_id,
                "no active cores on the chain".to_string(),
            ))?
        }
        Ok(())
    }

    async fn check_chip(&mut self, index: usize) -> Result<()> {
        let chip_id = self.chip_id_of(index);
        let mut status = self.cmd_read_bist(chip_id)?;
        for _ in 0..BIST_RETRIES {
            if !status.busy {
                break;
            }
            sleep(Duration::from_millis(BIST_WAIT_MS)).await;
            status = self.cmd_read_bist(chip_id)?;
        }
        if status.busy {
            error!("{}: chip {}: error in READ_BIST", self.chain_id, chip_id);
            let chip = &mut self.chips[index];
            chip.num_cores = 0;
            chip.perf = 0;
            return Ok(());
        }

        let min_cores = self.opts.min_cores;
        let chain_id = self.chain_id;
        let chip = &mut self.chips[index];
        chip.num_cores = status.cores as usize;
        if chip.hw_type == btc08::HwType::Asic && chip.num_cores < min_cores {
            error!(
                "{}: chip {} has not enough cores ({}, minimum is {})",
                chain_id, chip_id, chip.num_cores, min_cores
            );
            chip.num_cores = 0;
            chip.perf = 0;
            return Ok(());
        }
        chip.perf = chip.num_cores as u64 * chip.mhz;
        debug!(
            "{}: chip {} with {} active cores, perf {}",
            chain_id, chip_id, chip.num_cores, chip.perf
        );
        self.num_cores += status.cores as usize;
        self.perf += self.chips[index].perf;
        Ok(())
    }

    /// Split the nonce space over the active chips in proportion to their
    /// measured performance. In test mode every chip walks the full space.
    fn assign_nonce_ranges(&mut self) -> Result<()> {
        let active: Vec<usize> = self
            .live_range()
            .filter(|&i| self.chips[i].is_active())
            .collect();
        if active.is_empty() {
            Err(ErrorKind::Hashboard(
                self.chain_id,
                "no chips left for nonce distribution".to_string(),
            ))?
        }

        if self.opts.test_mode {
            for &i in &active {
                self.chips[i].start_nonce = 0;
                self.chips[i].end_nonce = config::MAX_NONCE;
            }
        } else {
            let total: u64 = active.iter().map(|&i| self.chips[i].perf).sum();
            let mut start = 0u32;
            for (pos, &i) in active.iter().enumerate() {
                let end = if pos == active.len() - 1 {
                    config::MAX_NONCE
                } else {
                    start
                        + ((config::MAX_NONCE as u64 * self.chips[i].perf) / total) as u32
                };
                self.chips[i].start_nonce = start;
                self.chips[i].end_nonce = end;
                start = end.wrapping_add(1);
            }
        }

        self.disabled = false;
        for &i in &active {
            let chip_id = self.chip_id_of(i);
            let (start, end) = (self.chips[i].start_nonce, self.chips[i].end_nonce);
            debug!(
                "{}: chip {} (index {}): {:08x} ~ {:08x}",
                self.chain_id, chip_id, i, start, end
            );
            self.cmd_write_nonce(chip_id, start, end)?;
        }
        Ok(())
    }

    /// Re-run the bring-up sequence on the already known chip inventory
    /// (after a flush or a supervisor intervention)
    async fn reinit(&mut self) -> Result<()> {
        if let Some(power) = self.power.as_mut() {
            power.apply_level()?;
        }
        self.cmd_reset_bcast()?;
        let count = self.cmd_auto_address()? as usize;
        if count != self.num_active_chips() {
            Err(ErrorKind::Framing(format!(
                "chain shrank: {} chips addressed, {} expected",
                count,
                self.num_active_chips()
            )))?
        }
        for chip_id in (1..=count as u8).rev() {
            if self.cmd_read_id(chip_id)?.is_none() {
                Err(ErrorKind::Framing(format!(
                    "chip {} did not echo its address",
                    chip_id
                )))?
            }
        }
        self.survey_chips(count)?;
        self.is_processing = false;
        self.program_pll().await?;
        self.run_bist().await?;
        self.cmd_set_control(ChipAddress::All, config::OON_IRQ_EN | self.opts.udiv)?;
        self.assign_nonce_ranges()?;
        Ok(())
    }

    /* ---------------- job pipeline ---------------- */

    /// Push one work into the chips' job FIFO. Returns true when the slot
    /// being reused held a finished work (a nonce range completed).
    fn set_work(&mut self, work: hal::Work, host: &dyn hal::MiningHost) -> Result<bool> {
        let job_id = self.registry.next_job_id();
        debug!("{}: queuing job_id {}", self.chain_id, job_id);

        let mut range_finished = false;
        if let Some(prior) = self.registry.evict_next_slot() {
            host.work_completed(prior);
            range_finished = true;
        }

        let mut msgs = Vec::with_capacity(3);
        msgs.push(io::BatchMsg::fast(btc08::make_frame(
            Command::WriteParm,
            ChipAddress::All,
            &work.job_params(),
            0,
        )));
        if self.sdiff != work.sdiff {
            self.sdiff = work.sdiff;
            info!("{}: share difficulty now {:.2}", self.chain_id, work.sdiff);
            msgs.push(io::BatchMsg::fast(btc08::make_frame(
                Command::WriteTarget,
                ChipAddress::All,
                &btc08::encode_target(&work.target),
                0,
            )));
        }
        let mut extra = 0u8;
        if work.pool.has_vmask() {
            extra |= btc08::ASIC_BOOST_EN;
        }
        msgs.push(io::BatchMsg::fast(btc08::make_frame(
            Command::RunJob,
            ChipAddress::All,
            &[extra, job_id],
            0,
        )));

        if let Err(e) = self.io.transfer_batch(&msgs) {
            error!(
                "{}: failed to set work for job {} with spi err",
                self.chain_id, job_id
            );
            host.work_completed(work);
            self.disabled = true;
            return Err(e);
        }
        self.registry.commit(work);
        Ok(range_finished)
    }

    /// Drain the result queue of the chain after the GN line dropped
    fn process_golden_nonces(
        &mut self,
        host: &dyn hal::MiningHost,
        ranges_processed: &mut i64,
    ) -> Result<()> {
        loop {
            let resp = self.cmd_read_job_id_bcast()?;
            if btc08::gn_queue_empty(&resp) {
                debug!("{}: output queue empty", self.chain_id);
                return Ok(());
            }
            let status = btc08::JobStatus::from_resp(&resp);
            if !status.gn_irq {
                // only the out-of-nonce flag is up; the OON branch owns it
                return Ok(());
            }

            // fetch the result first: READ_RESULT clears the chip's GN
            // interrupt even when the status turns out to be garbage
            let chip_id = status.chip_id;
            self.cmd_read_hash(chip_id)?;
            let result = self.cmd_read_result(chip_id)?;

            if chip_id < 1 || chip_id as usize > self.num_active_chips() {
                warn!("{}: wrong chip_id {}", self.chain_id, chip_id);
                continue;
            }
            if status.gn_job_id < 1 || status.gn_job_id as usize > registry::JOB_ID_SLOTS {
                warn!(
                    "{}: chip {}: result has wrong job_id {}",
                    self.chain_id, chip_id, status.gn_job_id
                );
                self.flush_spi()?;
                continue;
            }

            let chip_index = self.index_of(chip_id);
            let chain_id = self.chain_id;

            match self.registry.get_mut(status.gn_job_id) {
                None => {
                    // already been flushed
                    warn!(
                        "{}: chip {}: stale nonce {:#010x} {:#010x} {:#010x} {:#010x}",
                        chain_id,
                        chip_id,
                        result.nonces[0],
                        result.nonces[1],
                        result.nonces[2],
                        result.nonces[3]
                    );
                    self.chips[chip_index].stales += 1;
                    continue;
                }
                Some(work) => {
                    for set in 0..btc08::ASIC_BOOST_CORE_NUM {
                        let micro_job_bit = 1u8 << set;
                        if result.micro_job_id & micro_job_bit == 0 {
                            continue;
                        }
                        let nonce = result.nonces[set];
                        work.apply_micro_job(micro_job_bit);
                        if host.submit_nonce(work, nonce) {
                            debug!(
                                "{}: chip {} (job_id {}, micro_job {}): nonce {:#010x}",
                                chain_id, chip_id, status.gn_job_id, micro_job_bit, nonce
                            );
                            self.chips[chip_index].nonces_found += 1;
                        } else {
                            error!(
                                "{}: chip {} (job_id {}, micro_job {}): invalid nonce {:#010x}",
                                chain_id, chip_id, status.gn_job_id, micro_job_bit, nonce
                            );
                            self.chips[chip_index].hw_errors += 1;
                            // a full nonce range of penalty per bad nonce
                            *ranges_processed -= 1;
                        }
                    }
                }
            }
        }
    }

    /// One scan tick: keep the job FIFO primed and watch the interrupt
    /// lines. Returns the number of hashes attempted.
    pub async fn scan_work(&mut self, host: &dyn hal::MiningHost) -> Result<u64> {
        if self.disabled {
            error!("{}: chain is disabled", self.chain_id);
            Err(ErrorKind::ChainDisabled)?
        }
        if self.num_cores == 0 || self.num_cores > config::MAX_CORES {
            error!("{}: wrong num_cores {}", self.chain_id, self.num_cores);
            self.disabled = true;
            Err(ErrorKind::ChainDisabled)?
        }

        let mut ranges_processed: i64 = 0;

        if !self.is_processing {
            // fill the 4-deep job FIFO before the first poll
            for _ in 0..registry::MAX_JOB_FIFO {
                match self.queue.dequeue() {
                    None => {
                        warn!("{}: work underflow", self.chain_id);
                        return Ok(0);
                    }
                    Some(work) => {
                        self.set_work(work, host)?;
                        self.is_processing = true;
                    }
                }
            }
        }

        let deadline = Instant::now() + self.timeout_oon;
        loop {
            if self.poll_line(Line::Gn)? {
                self.process_golden_nonces(host, &mut ranges_processed)?;
            }

            if self.poll_line(Line::Oon)? {
                ranges_processed += 2;
                self.cmd_clear_oon_bcast()?;
                // two fresh works per out-of-nonce event
                for _ in 0..2 {
                    match self.queue.dequeue() {
                        None => {
                            info!("{}: work underflow", self.chain_id);
                            break;
                        }
                        Some(work) => {
                            self.set_work(work, host)?;
                            self.is_processing = true;
                        }
                    }
                }
                break;
            }

            if Instant::now() >= deadline {
                warn!("{}: OON watchdog expired", self.chain_id);
                self.check_disabled_chips().await?;
                break;
            }

            sleep(Duration::from_millis(GN_POLL_SLEEP_MS)).await;
        }

        let ranges = ranges_processed.max(0) as u64;
        if ranges != 0 {
            debug!("{}: nonce ranges processed {}", self.chain_id, ranges);
        }
        Ok((ranges << 32) * btc08::ASIC_BOOST_CORE_NUM as u64)
    }

    /* ---------------- supervisor ---------------- */

    /// Hunt for the chip that stalled the chain after an OON watchdog
    /// timeout: unresponsive chips shorten the chain, overloaded ones get
    /// their clock stepped down.
    async fn check_disabled_chips(&mut self) -> Result<()> {
        let mut reset_needed = false;
        let mut failed_index = None;
        let live: Vec<usize> = self.live_range().rev().collect();
        let is_fpga = self.is_fpga();

        for i in live {
            let chip_id = self.chip_id_of(i);
            match self.cmd_read_id(chip_id)? {
                None => {
                    error!(
                        "{}: chip_id {} disabled, no response",
                        self.chain_id, chip_id
                    );
                    self.chips[i].take_out(Instant::now());
                    failed_index = Some(i);
                    reset_needed = true;
                    break;
                }
                Some(id_resp) => {
                    if !is_fpga && id_resp.pending_jobs >= config::OON_INT_MAXJOB {
                        reset_needed = true;
                        let min_freq = btc08::pll_min_freq();
                        let chip = &mut self.chips[i];
                        if chip.mhz > min_freq {
                            chip.mhz -= PLL_STEP_DOWN_MHZ;
                            warn!(
                                "{}: chip_id {} overloaded, stepping down to {} MHz",
                                self.chain_id, chip_id, chip.mhz
                            );
                        } else {
                            error!(
                                "{}: chip_id {} disabled, already at {} MHz",
                                self.chain_id, chip_id, chip.mhz
                            );
                            chip.take_out(Instant::now());
                            failed_index = Some(i);
                            break;
                        }
                    }
                }
            }
        }

        if !reset_needed {
            warn!("{}: no OON timeout offender found", self.chain_id);
            return Ok(());
        }
        if let Some(index) = failed_index {
            self.set_last_chip(index)?;
        }
        if let Err(e) = self.reinit().await {
            error!(
                "{}: re-init after OON timeout failed: {}",
                self.chain_id, e
            );
            self.disabled = true;
            return Err(e);
        }
        Ok(())
    }

    /// Cut the chain right above a failed chip: the next chip becomes the
    /// new end of the chain and the inventory below it is written off
    fn set_last_chip(&mut self, failed_index: usize) -> Result<()> {
        if failed_index + 1 >= self.chips.len() {
            self.disabled = true;
            Err(ErrorKind::Hashchip(
                "chain end failed, nothing left to mine with".to_string(),
            ))?
        }
        let marker_id = self.chip_id_of(failed_index) + 1;
        self.cmd_set_control(
            ChipAddress::One(marker_id),
            config::LAST_CHIP | self.opts.udiv,
        )?;
        let now = Instant::now();
        for i in self.last_chip..=failed_index {
            if !self.chips[i].is_disabled() {
                self.chips[i].take_out(now);
            }
        }
        self.last_chip = failed_index + 1;

        let count = self.cmd_auto_address()? as usize;
        if count != self.num_active_chips() {
            self.disabled = true;
            Err(ErrorKind::Framing(format!(
                "re-addressing found {} chips, {} expected",
                count,
                self.num_active_chips()
            )))?
        }
        info!(
            "{}: chain shortened, {} chips remain",
            self.chain_id, count
        );
        Ok(())
    }

    /* ---------------- driver shell ---------------- */

    /// The scheduler wants more work queued up?
    pub fn queue_full(&self) -> bool {
        self.queue.is_full()
    }

    /// Hand a templated work over to the driver
    pub fn push_work(&mut self, work: hal::Work) {
        self.queue.enqueue(work);
    }

    /// Abort everything in flight, hand all works back and re-init
    pub async fn flush_work(&mut self, host: &dyn hal::MiningHost) -> Result<()> {
        debug!("{}: flushing work", self.chain_id);
        self.reset_pulse().await?;
        for work in self.registry.drain() {
            host.work_completed(work);
        }
        for work in self.queue.drain() {
            host.work_completed(work);
        }
        self.registry.reset();
        self.sdiff = 0.0;
        self.is_processing = false;
        self.num_cores = 0;
        self.perf = 0;

        if let Err(e) = self.reinit().await {
            error!("{}: re-init after flush failed: {}", self.chain_id, e);
            self.disabled = true;
            Err(ErrorKind::ChainDisabled)?
        }
        Ok(())
    }

    pub fn stats(&mut self) -> hal::ChainStats {
        let volt_mv = self
            .power
            .as_ref()
            .and_then(|power| power.voltage_mv().ok())
            .unwrap_or(0);
        hal::ChainStats {
            chain_id: self.chain_id,
            asic_count: self.num_active_chips(),
            volt: volt_mv as f32 / 1000.0,
            hi_temp: self.high_temp_val,
            hot_chip: self.high_temp_id,
            chain_id_end: self.chain_id,
        }
    }
}

/// Compute backend over every BTC08 chain found on the box
pub struct Backend {
    pub chains: Vec<Arc<Mutex<HashChain<io::ChainIo>>>>,
}

impl Backend {
    /// Probe the SPI ports and initialize every responding chain
    pub async fn detect(opts: config::Options, hotplug: bool) -> Result<Backend> {
        let mut chains = Vec::new();
        // no hotplug support for SPI
        if hotplug {
            return Ok(Backend { chains });
        }
        let pin_mgr = gpio::ControlPinManager::new();
        for (port, &bus) in config::SPI_AVAILABLE_BUS.iter().enumerate() {
            match Self::probe_port(&pin_mgr, &opts, port, bus).await {
                Ok(chain) => {
                    info!(
                        "detected BTC08 chain {} with {} chips / {} cores",
                        port,
                        chain.num_active_chips(),
                        chain.num_cores()
                    );
                    chains.push(Arc::new(Mutex::new(chain)));
                }
                Err(e) => warn!("port {}: no BTC08 chain: {}", port, e),
            }
        }
        Ok(Backend { chains })
    }

    async fn probe_port(
        pin_mgr: &gpio::ControlPinManager,
        opts: &config::Options,
        port: usize,
        bus: u32,
    ) -> Result<HashChain<io::ChainIo>> {
        let plug = pin_mgr.get_pin_in(gpio::PinInName::Plug(port))?;
        if plug.is_low()? {
            Err(ErrorKind::Hashboard(port, "not present".to_string()))?
        }
        let mut pwr_en = pin_mgr.get_pin_out(gpio::PinOutName::PwrEn(port))?;
        pwr_en.set_high()?;

        let spi = spi::Spi::open(spi::Config {
            bus,
            cs: 0,
            speed_hz: opts.spi_clk_khz * 1000,
        })?;
        let chain_io = io::ChainIo::new(
            spi,
            pin_mgr.get_pin_in(gpio::PinInName::Gn(port))?,
            pin_mgr.get_pin_in(gpio::PinInName::Oon(port))?,
            pin_mgr.get_pin_out(gpio::PinOutName::Rst(port))?,
        );
        let mut power_ctrl = power::Control::new(
            pin_mgr.get_pin_out(gpio::PinOutName::Vctrl(port))?,
            port as u32,
        );
        power_ctrl.apply_level()?;

        let mut chain = HashChain::new(chain_io, opts.clone(), port, Some(power_ctrl));
        chain.init().await?;
        Ok(chain)
    }

    /// Spawn one scan task per chain. Tasks run until their chain dies.
    pub fn run(&self, host: Arc<dyn hal::MiningHost>) {
        for chain in self.chains.iter() {
            let chain = chain.clone();
            let host = host.clone();
            tokio::spawn(async move {
                loop {
                    let mut chain = chain.lock().await;
                    while !chain.queue_full() {
                        match host.get_work() {
                            Some(work) => chain.push_work(work),
                            None => break,
                        }
                    }
                    let outcome = chain.scan_work(host.as_ref()).await;
                    let chain_id = chain.chain_id();
                    drop(chain);
                    if let Err(e) = outcome {
                        error!("{}: scan work failed: {}", chain_id, e);
                        break;
                    }
                }
            });
        }
    }
}
