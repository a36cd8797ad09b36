// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Immutable driver configuration derived from the environment.
//!
//! The configuration is read once when a device is created and threaded
//! through the components that need it. There are no process-global mutable
//! toggles.

use std::env;

/// Driver-wide configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct Config {
    /// Verbose per-operation logging and guard-region checking. Also forces
    /// the legacy decode backend so that debug output reflects the simpler
    /// ioctl path.
    pub debug: bool,
    /// Skip scanning for a stateless V4L2 decoder and always use the
    /// device-specific decode ioctl.
    pub force_vde_backend: bool,
    /// Compose surfaces on the CPU instead of the 2D engine.
    pub force_software_compose: bool,
}

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(v) => !v.is_empty() && v != "0",
        Err(_) => false,
    }
}

impl Config {
    /// Builds the configuration from `TEGRA_VDP_*` environment variables.
    pub fn from_env() -> Self {
        let debug = env_flag("TEGRA_VDP_DEBUG");
        Config {
            debug,
            force_vde_backend: debug || env_flag("TEGRA_VDP_FORCE_VDE"),
            force_software_compose: env_flag("TEGRA_VDP_FORCE_SW_COMPOSE"),
        }
    }
}
