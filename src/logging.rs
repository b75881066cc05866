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

use std::env;

use lazy_static::lazy_static;
use slog::{o, Drain, Level, LevelFilter, Logger};

pub use slog;

lazy_static! {
    /// Build static reference to the logger that is shared by the whole driver
    pub static ref LOGGER: Logger = {
        let level = Level::Trace;

        // envlogger doesn't allow to set default log level, so this is a workaround
        if !env::var("RUST_LOG").is_ok() {
            env::set_var("RUST_LOG", "info");
        }

        let terminal_decorator = slog_term::TermDecorator::new().build();
        let terminal_drain = slog_term::FullFormat::new(terminal_decorator).build().fuse();
        let terminal_drain = LevelFilter::new(terminal_drain, level).fuse();
        let terminal_drain = slog_envlogger::new(terminal_drain);
        let terminal_drain = slog_async::Async::new(terminal_drain).build().fuse();

        Logger::root(terminal_drain, o!())
    };
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)+) => { $crate::logging::slog::trace!(&*$crate::logging::LOGGER, $($arg)+) };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => { $crate::logging::slog::debug!(&*$crate::logging::LOGGER, $($arg)+) };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)+) => { $crate::logging::slog::info!(&*$crate::logging::LOGGER, $($arg)+) };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => { $crate::logging::slog::warn!(&*$crate::logging::LOGGER, $($arg)+) };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)+) => { $crate::logging::slog::error!(&*$crate::logging::LOGGER, $($arg)+) };
}

/// Single import that brings the level macros into scope the usual way:
/// `use crate::logging::macros::*;`
pub mod macros {
    pub use crate::{debug, error, info, trace, warn};
}
