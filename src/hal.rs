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

//! Contract between the driver and the mining host
//!
//! The host owns pools, work templating and share accounting; the driver
//! borrows `Work` items for as long as they sit in a chip's job FIFO and
//! hands them back through [`MiningHost::work_completed`].

use crate::btc08;

/// Pool-side AsicBoost state attached to a work item
#[derive(Clone, Debug, PartialEq)]
pub struct Pool {
    /// Negotiated version-rolling mask; zero disables AsicBoost
    pub vmask: u32,
    /// Header version words keyed by micro-job bit (1, 2, 4, 8)
    pub vmask_001: [[u8; 4]; 16],
}

impl Pool {
    pub fn plain() -> Self {
        Self {
            vmask: 0,
            vmask_001: [[0u8; 4]; 16],
        }
    }

    pub fn version_rolling(vmask: u32, vmask_001: [[u8; 4]; 16]) -> Self {
        Self { vmask, vmask_001 }
    }

    #[inline]
    pub fn has_vmask(&self) -> bool {
        self.vmask != 0
    }
}

/// One unit of search work: four midstates over a shared header tail
#[derive(Clone, Debug)]
pub struct Work {
    pub midstates: [[u8; btc08::MIDSTATE_LEN]; btc08::ASIC_BOOST_CORE_NUM],
    /// 80-byte block header as the host's verifier expects it back. The
    /// driver reads the merkle/ntime/nbits tail and rewrites the version
    /// word on AsicBoost submissions.
    pub header: [u8; 80],
    /// Big-endian share target
    pub target: [u8; 32],
    /// Share difficulty the target encodes
    pub sdiff: f64,
    pub pool: Pool,
    /// Which of the four core sets produced the submitted nonce
    pub micro_job_id: u8,
}

impl Work {
    /// The chip's `data` parameter: merkle-root tail, ntime, nbits
    pub fn data_slice(&self) -> &[u8] {
        &self.header[64..76]
    }

    /// WRITE_PARM payload for this work
    pub fn job_params(&self) -> [u8; btc08::WRITE_JOB_LEN] {
        let mut params = [0u8; btc08::WRITE_JOB_LEN];
        params[0..32].copy_from_slice(&self.midstates[0]);
        params[32..44].copy_from_slice(self.data_slice());
        params[44..76].copy_from_slice(&self.midstates[1]);
        params[76..108].copy_from_slice(&self.midstates[2]);
        params[108..140].copy_from_slice(&self.midstates[3]);
        params
    }

    /// Stamp the work with the core set that found a nonce and apply the
    /// pool's version bits for that set
    pub fn apply_micro_job(&mut self, micro_job_bit: u8) {
        self.micro_job_id = micro_job_bit;
        if self.pool.has_vmask() {
            let version = self.pool.vmask_001[micro_job_bit as usize];
            self.header[0..4].copy_from_slice(&version);
        }
    }
}

/// Operations the mining host provides to the driver
pub trait MiningHost: Send + Sync {
    /// Next work unit, if the host has one templated
    fn get_work(&self) -> Option<Work>;

    /// The work has left the driver pipeline (range finished, flushed or
    /// failed) and may be retired
    fn work_completed(&self, work: Work);

    /// Validate and forward a nonce candidate. Returns false when the host
    /// rejects it, which the driver accounts as a hardware error.
    fn submit_nonce(&self, work: &Work, nonce: u32) -> bool;
}

/// Snapshot reported by the driver shell's stats operation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChainStats {
    pub chain_id: usize,
    pub asic_count: usize,
    /// Measured hash rail voltage in volts
    pub volt: f32,
    pub hi_temp: f32,
    pub hot_chip: usize,
    pub chain_id_end: usize,
}
