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

use embedded_hal;
use sysfs_gpio;

use crate::config::MAX_SPI_PORT;

// GPIO banks of the SoC, 32 lines each
const GPIO_A: u64 = 0;
const GPIO_D: u64 = 96;
const GPIO_E: u64 = 128;

// Per-port line assignments. Index is the SPI port the hash board hangs off.
const RST_PIN: [u64; MAX_SPI_PORT] = [GPIO_D + 31, GPIO_E + 4];
const GN_PIN: [u64; MAX_SPI_PORT] = [GPIO_D + 30, GPIO_E + 3];
const OON_PIN: [u64; MAX_SPI_PORT] = [GPIO_D + 29, GPIO_E + 2];
const VCTRL_PIN: [u64; MAX_SPI_PORT] = [GPIO_A + 20, GPIO_A + 9];
const PWR_EN_PIN: [u64; MAX_SPI_PORT] = [GPIO_A + 21, GPIO_A + 10];
const PLUG_PIN: [u64; MAX_SPI_PORT] = [GPIO_A + 24, GPIO_A + 11];
const BODDET_PIN: [u64; MAX_SPI_PORT] = [GPIO_A + 25, GPIO_A + 12];

/// Helper struct for altering output pins which implements OutputPin trait
#[derive(Clone)]
pub struct PinOut(sysfs_gpio::Pin);

impl embedded_hal::digital::v2::OutputPin for PinOut {
    type Error = sysfs_gpio::Error;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.set_value(0)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.set_value(1)
    }
}

/// Helper struct for reading input pins which implements InputPin trait
#[derive(Clone)]
pub struct PinIn(sysfs_gpio::Pin);

impl embedded_hal::digital::v2::InputPin for PinIn {
    type Error = sysfs_gpio::Error;

    fn is_high(&self) -> Result<bool, Self::Error> {
        self.0.get_value().map(|value| value > 0)
    }

    fn is_low(&self) -> Result<bool, Self::Error> {
        self.0.get_value().map(|value| value == 0)
    }
}

/// All known output pin types on a BTC08 board
#[derive(Debug, Copy, Clone)]
pub enum PinOutName {
    /// Active-low chain reset
    Rst(usize),
    /// Hash voltage select (low: 0.40 V point, high: 0.42 V point)
    Vctrl(usize),
    /// Fan/LDO enable
    PwrEn(usize),
}

/// All known input pin types on a BTC08 board
#[derive(Debug, Copy, Clone)]
pub enum PinInName {
    /// Golden-nonce interrupt level, active low
    Gn(usize),
    /// Out-of-nonce interrupt level, active low
    Oon(usize),
    /// Board presence
    Plug(usize),
    /// Board type strap
    BodDet(usize),
}

fn out_pin_num(pin_name: PinOutName) -> u64 {
    match pin_name {
        PinOutName::Rst(i) => {
            assert!(i < MAX_SPI_PORT, "Rst pin {} is out of range", i);
            RST_PIN[i]
        }
        PinOutName::Vctrl(i) => {
            assert!(i < MAX_SPI_PORT, "Vctrl pin {} is out of range", i);
            VCTRL_PIN[i]
        }
        PinOutName::PwrEn(i) => {
            assert!(i < MAX_SPI_PORT, "PwrEn pin {} is out of range", i);
            PWR_EN_PIN[i]
        }
    }
}

fn in_pin_num(pin_name: PinInName) -> u64 {
    match pin_name {
        PinInName::Gn(i) => {
            assert!(i < MAX_SPI_PORT, "Gn pin {} is out of range", i);
            GN_PIN[i]
        }
        PinInName::Oon(i) => {
            assert!(i < MAX_SPI_PORT, "Oon pin {} is out of range", i);
            OON_PIN[i]
        }
        PinInName::Plug(i) => {
            assert!(i < MAX_SPI_PORT, "Plug pin {} is out of range", i);
            PLUG_PIN[i]
        }
        PinInName::BodDet(i) => {
            assert!(i < MAX_SPI_PORT, "BodDet pin {} is out of range", i);
            BODDET_PIN[i]
        }
    }
}

/// Provides functionality for configuring the BTC08 control pins.
/// The pins can be accessed by name (see PinOutName and PinInName)
pub struct ControlPinManager;

impl ControlPinManager {
    pub fn new() -> Self {
        ControlPinManager {}
    }

    /// Returns a specified output pin and initializes it (export in sysfs)
    pub fn get_pin_out(&self, pin_name: PinOutName) -> Result<PinOut, sysfs_gpio::Error> {
        let pin = sysfs_gpio::Pin::new(out_pin_num(pin_name));
        pin.export()?;
        pin.set_direction(sysfs_gpio::Direction::Out)?;
        Ok(PinOut(pin))
    }

    /// Returns a specified input pin and initializes it (export in sysfs)
    pub fn get_pin_in(&self, pin_name: PinInName) -> Result<PinIn, sysfs_gpio::Error> {
        let pin = sysfs_gpio::Pin::new(in_pin_num(pin_name));
        pin.export()?;
        pin.set_direction(sysfs_gpio::Direction::In)?;
        Ok(PinIn(pin))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pin_tables() {
        assert_eq!(out_pin_num(PinOutName::Rst(0)), 127);
        assert_eq!(out_pin_num(PinOutName::Rst(1)), 132);
        assert_eq!(in_pin_num(PinInName::Gn(0)), 126);
        assert_eq!(in_pin_num(PinInName::Gn(1)), 131);
        assert_eq!(in_pin_num(PinInName::Oon(0)), 125);
        assert_eq!(in_pin_num(PinInName::Oon(1)), 130);
        assert_eq!(out_pin_num(PinOutName::Vctrl(0)), 20);
        assert_eq!(in_pin_num(PinInName::Plug(1)), 11);
    }

    #[test]
    #[should_panic]
    fn test_pin_out_of_range() {
        out_pin_num(PinOutName::Rst(MAX_SPI_PORT));
    }
}
