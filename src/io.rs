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

//! Hardware interface of one hash board
//!
//! Everything the chain controller touches goes through [`Interface`]: the
//! shared SPI link and the three board lines (golden-nonce and out-of-nonce
//! interrupt levels, reset). Production boards use [`ChainIo`]; tests drive
//! the controller against an emulated chain.

use crate::error;
use crate::gpio;
use crate::spi;

use embedded_hal::digital::v2::{InputPin, OutputPin};

pub use crate::spi::BatchMsg;

pub trait Interface: Send {
    /// Full-duplex exchange at the base clock; the returned buffer is
    /// already bit-corrected
    fn transfer(&mut self, tx: &[u8]) -> error::Result<Vec<u8>>;

    /// Full-duplex exchange at the fast clock
    fn transfer_fast(&mut self, tx: &[u8]) -> error::Result<Vec<u8>>;

    /// Ordered write-only burst submitted as one bus transaction
    fn transfer_batch(&mut self, msgs: &[BatchMsg]) -> error::Result<()>;

    /// Golden-nonce line asserted? (the line is active low)
    fn gn_asserted(&mut self) -> error::Result<bool>;

    /// Out-of-nonce line asserted? (the line is active low)
    fn oon_asserted(&mut self) -> error::Result<bool>;

    /// Drive the reset line; `false` holds the chain in reset
    fn set_reset(&mut self, level: bool) -> error::Result<()>;
}

/// Production implementation: spidev plus the sysfs GPIO lines of the port
pub struct ChainIo {
    spi: spi::Spi,
    gn: gpio::PinIn,
    oon: gpio::PinIn,
    rst: gpio::PinOut,
}

impl ChainIo {
    pub fn new(spi: spi::Spi, gn: gpio::PinIn, oon: gpio::PinIn, rst: gpio::PinOut) -> Self {
        Self { spi, gn, oon, rst }
    }
}

impl Interface for ChainIo {
    fn transfer(&mut self, tx: &[u8]) -> error::Result<Vec<u8>> {
        self.spi.transfer(tx)
    }

    fn transfer_fast(&mut self, tx: &[u8]) -> error::Result<Vec<u8>> {
        self.spi.transfer_fast(tx)
    }

    fn transfer_batch(&mut self, msgs: &[BatchMsg]) -> error::Result<()> {
        self.spi.transfer_batch(msgs)
    }

    fn gn_asserted(&mut self) -> error::Result<bool> {
        Ok(self.gn.is_low()?)
    }

    fn oon_asserted(&mut self) -> error::Result<bool> {
        Ok(self.oon.is_low()?)
    }

    fn set_reset(&mut self, level: bool) -> error::Result<()> {
        if level {
            self.rst.set_high()?;
        } else {
            self.rst.set_low()?;
        }
        Ok(())
    }
}
