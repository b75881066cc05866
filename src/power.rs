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

//! Hash voltage control and readback
//!
//! The hash rail is selected between two set points with a GPIO line and
//! measured through a channel of the SoC ADC (12 bit, 1.8 V full scale).

use crate::error::{self, ErrorKind};
use crate::gpio;
use crate::logging::macros::*;

use embedded_hal::digital::v2::OutputPin;
use failure::ResultExt;

/// Selectable set points of the hash rail in mV, indexed by the VCTRL level
pub const VOLTAGE_SET_POINTS_MV: [u32; 2] = [400, 420];

const IIO_DEVICE_PATH: &'static str = "/sys/bus/iio/devices/iio:device0";

/// 12-bit raw ADC value to millivolts (1.8 V full scale)
pub fn adc_to_mv(raw: u32) -> u32 {
    raw * 1800 / 4096
}

/// Acceptance window of a set point: the measurement must land within 10%
pub fn acceptance_window_mv(level: usize) -> (u32, u32) {
    let set_point = VOLTAGE_SET_POINTS_MV[level];
    (set_point - set_point / 10, set_point + set_point / 10)
}

/// Voltage control of one hash board: select line plus sense channel
pub struct Control {
    vctrl: gpio::PinOut,
    sense_channel: u32,
    level: usize,
}

impl Control {
    pub fn new(vctrl: gpio::PinOut, sense_channel: u32) -> Self {
        Self {
            vctrl,
            sense_channel,
            level: 0,
        }
    }

    pub fn set_level(&mut self, level: usize) -> error::Result<()> {
        assert!(level < VOLTAGE_SET_POINTS_MV.len());
        self.level = level;
        self.apply_level()
    }

    /// Drive the select line to the currently chosen set point
    pub fn apply_level(&mut self) -> error::Result<()> {
        if self.level == 0 {
            self.vctrl.set_low()?;
        } else {
            self.vctrl.set_high()?;
        }
        Ok(())
    }

    /// Measured rail voltage in millivolts
    pub fn voltage_mv(&self) -> error::Result<u32> {
        let path = format!(
            "{}/in_voltage{}_raw",
            IIO_DEVICE_PATH, self.sense_channel
        );
        let content = std::fs::read_to_string(&path)
            .context(ErrorKind::Power(format!("cannot read {}", path)))?;
        let raw: u32 = content
            .trim()
            .parse()
            .map_err(|_| ErrorKind::Power(format!("bad ADC value '{}'", content.trim())))?;
        Ok(adc_to_mv(raw))
    }

    /// Verify the rail sits inside the acceptance window of the set point
    pub fn check(&self) -> error::Result<u32> {
        let mv = self.voltage_mv()?;
        let (min, max) = acceptance_window_mv(self.level);
        if mv < min || mv > max {
            error!(
                "power error ({} mV detected, must be {} mV)",
                mv, VOLTAGE_SET_POINTS_MV[self.level]
            );
            Err(ErrorKind::Power(format!(
                "rail at {} mV, outside {}..{} mV",
                mv, min, max
            )))?
        }
        Ok(mv)
    }
}
