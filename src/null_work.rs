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

//! Deterministic dummy work for tests and chip warm-up

use crate::hal;

/// Difficulty-1 share target (big endian)
fn diff1_target() -> [u8; 32] {
    let mut target = [0u8; 32];
    target[4] = 0xff;
    target[5] = 0xff;
    target
}

/// * `i` - unique identifier stamped into the generated midstates
pub fn prepare(i: u64) -> hal::Work {
    let mut midstate = [0u8; 32];
    midstate[..std::mem::size_of::<u64>()].copy_from_slice(&i.to_le_bytes());

    hal::Work {
        midstates: [midstate; 4],
        header: [0u8; 80],
        target: diff1_target(),
        sdiff: 1.0,
        pool: hal::Pool::plain(),
        micro_job_id: 0,
    }
}

/// Same dummy work at a specific share difficulty
pub fn prepare_with_sdiff(i: u64, sdiff: f64) -> hal::Work {
    let mut work = prepare(i);
    work.sdiff = sdiff;
    work
}
