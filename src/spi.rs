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

//! SPI transport to the chip chain
//!
//! All transfers are full duplex and a multiple of 4 bytes long. The chips
//! drive MISO idle-high, so every received byte arrives bit-inverted; the
//! inversion is undone here and is part of the wire protocol, not an option.

use crate::error::{self, ErrorKind};
use crate::logging::macros::*;

use failure::ResultExt;
use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};

/// Ceiling for the fast command path; the chips cannot latch faster than this
pub const MAX_TX_SPI_SPEED_HZ: u32 = 10_000_000;

/// Fast commands run at a multiple of the base clock, capped at the maximum
const FAST_CLOCK_MULTIPLIER: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    pub bus: u32,
    pub cs: u32,
    pub speed_hz: u32,
}

/// Clock selection for one sub-transfer of a batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Speed {
    Base,
    Fast,
}

/// One message of a batched transfer. Batches are write-only: they push
/// pre-built command frames down the chain without reading anything back.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchMsg {
    pub tx: Vec<u8>,
    pub speed: Speed,
    /// Release chip select between this message and the next one
    pub cs_change: bool,
}

impl BatchMsg {
    pub fn fast(tx: Vec<u8>) -> Self {
        Self {
            tx,
            speed: Speed::Fast,
            cs_change: true,
        }
    }
}

/// Every byte returned by the chain arrives inverted (idle-high MISO)
pub fn invert(buf: &mut [u8]) {
    for byte in buf.iter_mut() {
        *byte ^= 0xff;
    }
}

/// Transfer lengths have to match the 4-byte granularity of the chip bus
pub fn check_aligned(len: usize) -> error::Result<()> {
    if len % 4 != 0 {
        Err(ErrorKind::Spi(format!(
            "length must be 4 bytes aligned, {} is not allowed",
            len
        )))?
    }
    Ok(())
}

pub struct Spi {
    dev: Spidev,
    config: Config,
    fast_speed_hz: u32,
}

impl Spi {
    /// Open and configure `/dev/spidevB.C` (MODE 0, 8 bits per word)
    pub fn open(config: Config) -> error::Result<Self> {
        let path = format!("/dev/spidev{}.{}", config.bus, config.cs);
        let mut dev =
            Spidev::open(&path).context(ErrorKind::Spi(format!("cannot open {}", path)))?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(config.speed_hz)
            .mode(SpiModeFlags::SPI_MODE_0)
            .build();
        dev.configure(&options)
            .context(ErrorKind::Spi(format!("cannot configure {}", path)))?;
        let fast_speed_hz =
            (config.speed_hz * FAST_CLOCK_MULTIPLIER).min(MAX_TX_SPI_SPEED_HZ);
        info!(
            "SPI '{}': mode=0, bits=8, speed={}, fast={}",
            path, config.speed_hz, fast_speed_hz
        );
        Ok(Self {
            dev,
            config,
            fast_speed_hz,
        })
    }

    fn transfer_at(&mut self, tx: &[u8], speed_hz: u32) -> error::Result<Vec<u8>> {
        check_aligned(tx.len())?;
        let mut rx = vec![0xffu8; tx.len()];
        {
            let mut xfer = SpidevTransfer::read_write(tx, &mut rx);
            xfer.speed_hz = speed_hz;
            xfer.cs_change = 1;
            self.dev
                .transfer(&mut xfer)
                .context(ErrorKind::Spi("transfer ioctl failed".to_string()))?;
        }
        invert(&mut rx);
        trace!("spi tx: {}", hex::encode(tx));
        trace!("spi rx: {}", hex::encode(&rx));
        Ok(rx)
    }

    /// Full-duplex exchange at the base clock
    pub fn transfer(&mut self, tx: &[u8]) -> error::Result<Vec<u8>> {
        let speed = self.config.speed_hz;
        self.transfer_at(tx, speed)
    }

    /// Full-duplex exchange at the fast clock, for commands that must
    /// traverse the chain without stretching the hash window
    pub fn transfer_fast(&mut self, tx: &[u8]) -> error::Result<Vec<u8>> {
        let speed = self.fast_speed_hz;
        self.transfer_at(tx, speed)
    }

    /// Submit an ordered list of write-only messages with a single ioctl
    pub fn transfer_batch(&mut self, msgs: &[BatchMsg]) -> error::Result<()> {
        for msg in msgs {
            check_aligned(msg.tx.len())?;
            trace!("spi batch tx: {}", hex::encode(&msg.tx));
        }
        let mut xfers: Vec<SpidevTransfer> = msgs
            .iter()
            .map(|msg| {
                let mut xfer = SpidevTransfer::write(&msg.tx);
                xfer.speed_hz = match msg.speed {
                    Speed::Base => self.config.speed_hz,
                    Speed::Fast => self.fast_speed_hz,
                };
                xfer.cs_change = msg.cs_change as u8;
                xfer
            })
            .collect();
        self.dev
            .transfer_multiple(&mut xfers)
            .context(ErrorKind::Spi("batch transfer ioctl failed".to_string()))?;
        Ok(())
    }

    pub fn fast_speed_hz(&self) -> u32 {
        self.fast_speed_hz
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_invert_round_trip() {
        let mut buf = [0x00u8, 0x55, 0xaa, 0xff];
        invert(&mut buf);
        assert_eq!(buf, [0xff, 0xaa, 0x55, 0x00]);
        invert(&mut buf);
        assert_eq!(buf, [0x00, 0x55, 0xaa, 0xff]);
    }

    #[test]
    fn test_alignment_check() {
        assert!(check_aligned(0).is_ok());
        assert!(check_aligned(8).is_ok());
        assert!(check_aligned(144).is_ok());
        assert!(check_aligned(2).is_err());
        assert!(check_aligned(18).is_err());
    }

    #[test]
    fn test_batch_msg_defaults() {
        let msg = BatchMsg::fast(vec![0u8; 8]);
        assert_eq!(msg.speed, Speed::Fast);
        assert!(msg.cs_change);
    }
}
