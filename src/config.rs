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

//! Driver configuration and option parsing

use crate::error::{self, ErrorKind};

use serde::Deserialize;
use std::time::Duration;

/// Number of chips a fully populated chain carries
pub const MAX_CHIP_NUM: usize = 66;

/// Number of hashing cores on one chip
pub const MAX_CORES_PER_CHIP: usize = 206;

/// Upper bound on cores across the whole chain, used as a sanity gate
pub const MAX_CORES: usize = MAX_CHIP_NUM * MAX_CORES_PER_CHIP;

/// Default gate for a usable chip (90% of cores must pass BIST)
pub const DEFAULT_MIN_CORES: usize = MAX_CORES_PER_CHIP * 9 / 10;

/// Default gate for a usable chain (90% of chips must enumerate)
pub const DEFAULT_MIN_CHIPS: usize = MAX_CHIP_NUM * 9 / 10;

/// Default SPI clock; the chips need at least 1.2 MHz to latch commands
pub const DEFAULT_SPI_CLK_KHZ: u32 = 2000;

/// Default system PLL frequency in MHz
pub const DEFAULT_PLL_MHZ: u64 = 550;

/// Default UART divider written with SET_CONTROL
pub const DEFAULT_UDIV: u32 = 16 + 1;

/// SET_CONTROL flag: enable the out-of-nonce interrupt line
pub const OON_IRQ_EN: u32 = 1 << 4;

/// SET_CONTROL flag: mark the addressed chip as the end of the chain
pub const LAST_CHIP: u32 = 1 << 15;

/// FPGA prototypes run their cores at a fixed clock
pub const FPGA_MINER_CORE_CLK_MHZ: u64 = 50;

/// Top of the nonce space distributed over the chain
pub const MAX_NONCE: u32 = 0xffff_ffff;

/// A job touching more than this many queued jobs per chip signals overload
pub const OON_INT_MAXJOB: u8 = 2;

/// Watchdog on the out-of-nonce interrupt
pub const TIME_LIMIT_OF_OON: Duration = Duration::from_millis(4000);
pub const TIME_LIMIT_OF_OON_FPGA: Duration = Duration::from_millis(120_000);

/// An overheated chip stays off this long before it may be looked at again
pub const COOLDOWN: Duration = Duration::from_secs(30);

/// SPI ports that may carry a hash board
pub const MAX_SPI_PORT: usize = 2;
pub const SPI_AVAILABLE_BUS: [u32; MAX_SPI_PORT] = [0, 2];

fn default_spi_clk_khz() -> u32 {
    DEFAULT_SPI_CLK_KHZ
}

fn default_pll() -> u64 {
    DEFAULT_PLL_MHZ
}

fn default_udiv() -> u32 {
    DEFAULT_UDIV
}

fn default_min_cores() -> usize {
    DEFAULT_MIN_CORES
}

fn default_min_chips() -> usize {
    DEFAULT_MIN_CHIPS
}

/// Runtime options of the driver. The host parses its command line and hands
/// the relevant flags over; a TOML file with the same fields is accepted too.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Options {
    #[serde(default = "default_spi_clk_khz")]
    pub spi_clk_khz: u32,
    /// Requested chip frequency in MHz
    #[serde(default = "default_pll")]
    pub pll: u64,
    /// UART divider; bit 4 is OON_IRQ_EN, bit 15 the LAST_CHIP marker
    #[serde(default = "default_udiv")]
    pub udiv: u32,
    /// Limit chip chain to this number of chips (testing only)
    #[serde(default)]
    pub override_chip_num: Option<usize>,
    #[serde(default = "default_min_cores")]
    pub min_cores: usize,
    #[serde(default = "default_min_chips")]
    pub min_chips: usize,
    /// Production hash-board test harness flag; parsed but the harness is
    /// not part of this driver
    #[serde(default)]
    pub test_mode: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            spi_clk_khz: DEFAULT_SPI_CLK_KHZ,
            pll: DEFAULT_PLL_MHZ,
            udiv: DEFAULT_UDIV,
            override_chip_num: None,
            min_cores: DEFAULT_MIN_CORES,
            min_chips: DEFAULT_MIN_CHIPS,
            test_mode: false,
        }
    }
}

impl Options {
    /// Apply the legacy `spi_clk:pll:udiv` option string. A zero or missing
    /// field keeps the current value.
    pub fn apply_option_string(&mut self, options: &str) -> error::Result<()> {
        for (idx, field) in options.split(':').enumerate() {
            if idx >= 3 {
                Err(ErrorKind::Config(format!(
                    "too many fields in option string '{}'",
                    options
                )))?
            }
            let field = field.trim();
            if field.is_empty() {
                continue;
            }
            let value: u64 = field.parse().map_err(|_| {
                ErrorKind::Config(format!("invalid number '{}' in option string", field))
            })?;
            if value == 0 {
                continue;
            }
            match idx {
                0 => self.spi_clk_khz = value as u32,
                1 => self.pll = value,
                2 => self.udiv = value as u32,
                _ => unreachable!(),
            }
        }
        Ok(())
    }

    pub fn add_args<'a, 'b>(app: clap::App<'a, 'b>) -> clap::App<'a, 'b> {
        app.arg(
            clap::Arg::with_name("btc08-options")
                .long("btc08-options")
                .help("Chain options as spi_clk:pll:udiv (0 keeps the default)")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("btc08-min-cores")
                .long("btc08-min-cores")
                .help("Minimum number of good cores per chip")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("btc08-min-chips")
                .long("btc08-min-chips")
                .help("Minimum number of chips per chain")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("btc08-chiptest")
                .long("btc08-chiptest")
                .help("Run the hash board production test instead of mining")
                .required(false),
        )
    }

    pub fn parse(matches: &clap::ArgMatches) -> error::Result<Self> {
        let mut options = Self::default();
        if let Some(value) = matches.value_of("btc08-options") {
            options.apply_option_string(value)?;
        }
        if let Some(value) = matches.value_of("btc08-min-cores") {
            options.min_cores = value
                .parse()
                .map_err(|_| ErrorKind::Config(format!("invalid min-cores '{}'", value)))?;
        }
        if let Some(value) = matches.value_of("btc08-min-chips") {
            options.min_chips = value
                .parse()
                .map_err(|_| ErrorKind::Config(format!("invalid min-chips '{}'", value)))?;
        }
        options.test_mode = matches.is_present("btc08-chiptest");
        Ok(options)
    }

    pub fn from_file(path: &str) -> error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let options = toml::from_str(&content)
            .map_err(|e| ErrorKind::Config(format!("{}: {}", path, e)))?;
        Ok(options)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.spi_clk_khz, 2000);
        assert_eq!(options.pll, 550);
        assert_eq!(options.udiv, 17);
        assert_eq!(options.min_cores, 185);
        assert_eq!(options.min_chips, 59);
        assert_eq!(options.test_mode, false);
    }

    #[test]
    fn test_option_string() {
        let mut options = Options::default();
        options
            .apply_option_string("4000:700:33")
            .expect("option string rejected");
        assert_eq!(options.spi_clk_khz, 4000);
        assert_eq!(options.pll, 700);
        assert_eq!(options.udiv, 33);
    }

    /// Zero fields keep the defaults, the way the original option string works
    #[test]
    fn test_option_string_zero_keeps_default() {
        let mut options = Options::default();
        options
            .apply_option_string("0:650:0")
            .expect("option string rejected");
        assert_eq!(options.spi_clk_khz, 2000);
        assert_eq!(options.pll, 650);
        assert_eq!(options.udiv, 17);
    }

    #[test]
    fn test_option_string_invalid() {
        let mut options = Options::default();
        assert!(options.apply_option_string("2000:pll:17").is_err());
        assert!(options.apply_option_string("1:2:3:4").is_err());
    }

    #[test]
    fn test_clap_round_trip() {
        let app = Options::add_args(clap::App::new("test"));
        let matches = app
            .get_matches_from_safe(vec![
                "test",
                "--btc08-options",
                "1200:300:3",
                "--btc08-min-cores",
                "2",
                "--btc08-min-chips",
                "1",
            ])
            .expect("argument parsing failed");
        let options = Options::parse(&matches).expect("options parsing failed");
        assert_eq!(options.spi_clk_khz, 1200);
        assert_eq!(options.pll, 300);
        assert_eq!(options.udiv, 3);
        assert_eq!(options.min_cores, 2);
        assert_eq!(options.min_chips, 1);
    }

    #[test]
    fn test_toml() {
        let options: Options =
            toml::from_str("pll = 650\nmin_chips = 10\n").expect("toml parsing failed");
        assert_eq!(options.pll, 650);
        assert_eq!(options.min_chips, 10);
        // everything else keeps its default
        assert_eq!(options.spi_clk_khz, 2000);
        assert_eq!(options.min_cores, 185);
    }
}
