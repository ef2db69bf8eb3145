use std::{env, path::PathBuf};

use log::warn;

const STATE_DIR_VAR: &str = "SLEEPY_STATE_DIR";
const TIME_ZONE_VAR: &str = "SLEEPY_TZ";
const CYCLES_VAR: &str = "SLEEPY_CYCLES";

const DEFAULT_STATE_DIR: &str = "sleepy-state";
const DEFAULT_TIME_ZONE: &str = "EST5EDT,M3.2.0,M11.1.0";
const DEFAULT_CYCLES: u32 = 3;

/// Runner settings read from the environment at start-up.
#[derive(Debug, Clone)]
pub(super) struct RunnerConfig {
    pub state_dir: PathBuf,
    pub time_zone: String,
    pub cycles: u32,
}

impl RunnerConfig {
    pub(super) fn from_env() -> Self {
        let state_dir = env::var_os(STATE_DIR_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
        let time_zone = env::var(TIME_ZONE_VAR).unwrap_or_else(|_| DEFAULT_TIME_ZONE.to_owned());
        let cycles = match env::var(CYCLES_VAR) {
            Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!("sleepy: {}={:?} is not a count, using {}", CYCLES_VAR, raw, DEFAULT_CYCLES);
                DEFAULT_CYCLES
            }),
            Err(_) => DEFAULT_CYCLES,
        };
        Self {
            state_dir,
            time_zone,
            cycles,
        }
    }
}
