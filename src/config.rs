// HOTPLUGD CONFIGURATION
// STARTUP: TOML FILE (OPTIONAL) -> Config.
// RUNTIME: Tunables, ONE KEYED MAP OF VALIDATED NUMERIC KNOBS.
//
// KEYS (n = NUMBER OF POSSIBLE CPUS):
//   lock                      GOVERNOR OVERRIDE FLAG (HANDLED BY governor.rs)
//   load_h0 .. load_h{n-2}    HIGH % PER LEVEL (load_h{n-1} IS PINNED AT 100)
//   load_l1 .. load_l{n-1}    LOW % PER LEVEL (load_l0 IS PINNED AT 0)
//   bound_freq                ADD IS SUPPRESSED AT OR BELOW THIS KHZ
//   trans_rq, trans_load_rq   EMPTY-QUEUE REMOVAL THRESHOLDS
//   hold_ms                   AMBIGUOUS-BAND DWELL BEFORE FORCED REMOVE

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::tuning::{self, Intervals, Policy, ThresholdTable};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/hotplugd.toml";
pub const DEFAULT_SOCKET_PATH: &str = "/run/hotplugd.sock";

// --- STARTUP CONFIG ---

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BandOverride {
    pub cpus: usize,
    pub low: Option<u32>,
    pub high: Option<u32>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub boot_delay_secs: u64,
    pub normal_interval_ms: u64,
    pub settle_interval_ms: u64,
    pub hold_ms: u64,
    pub trans_rq: u64,
    pub trans_load_rq: u32,
    pub mips_low: u64,
    pub mips_high: u64,
    pub freq_floor_khz: Option<u32>,
    pub freq_poll_ms: u64,
    pub socket: PathBuf,
    pub dry_run: bool,
    pub thresholds: Vec<BandOverride>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            boot_delay_secs: tuning::BOOT_DELAY.as_secs(),
            normal_interval_ms: tuning::NORMAL_INTERVAL.as_millis() as u64,
            settle_interval_ms: tuning::SETTLE_INTERVAL.as_millis() as u64,
            hold_ms: tuning::HOLD_DURATION.as_millis() as u64,
            trans_rq: tuning::TRANS_RQ,
            trans_load_rq: tuning::TRANS_LOAD_RQ,
            mips_low: tuning::MIPS_LOW,
            mips_high: tuning::MIPS_HIGH,
            freq_floor_khz: None,
            freq_poll_ms: 20,
            socket: PathBuf::from(DEFAULT_SOCKET_PATH),
            dry_run: false,
            thresholds: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::File { path: path.to_path_buf(), source })?;
        Self::from_toml(&raw)
    }

    // EXPLICIT PATH MUST EXIST. OTHERWISE THE DEFAULT PATH IS OPTIONAL.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(p) => Self::load(p),
            None => {
                let p = Path::new(DEFAULT_CONFIG_PATH);
                if p.exists() { Self::load(p) } else { Ok(Self::default()) }
            }
        }
    }

    pub fn intervals(&self) -> Intervals {
        Intervals {
            boot: Duration::from_secs(self.boot_delay_secs),
            normal: Duration::from_millis(self.normal_interval_ms.max(1)),
            settle: Duration::from_millis(self.settle_interval_ms.max(1)),
        }
    }

    // freq_min_khz: LOWEST VALID TABLE FREQUENCY, THE DEFAULT FLOOR
    pub fn policy(&self, freq_min_khz: u32) -> Policy {
        Policy {
            freq_floor_khz: self.freq_floor_khz.unwrap_or(freq_min_khz),
            trans_rq: self.trans_rq,
            trans_load_rq: self.trans_load_rq,
            hold: Duration::from_millis(self.hold_ms),
        }
    }

    // [[thresholds]] ENTRIES, cpus IS THE ONLINE COUNT (1-BASED)
    pub fn apply_overrides(&self, table: &mut ThresholdTable) -> Result<(), ConfigError> {
        for o in &self.thresholds {
            if o.cpus == 0 || o.cpus > table.len() {
                return Err(ConfigError::OutOfRange {
                    key: "thresholds.cpus".into(),
                    value: o.cpus as u64,
                    max: table.len() as u64,
                });
            }
            let level = o.cpus - 1;
            if let Some(low) = o.low {
                table.set_low(level, check_pct(&format!("load_l{}", level), low as u64)?);
            }
            if let Some(high) = o.high {
                table.set_high(level, check_pct(&format!("load_h{}", level), high as u64)?);
            }
        }
        Ok(())
    }
}

// --- RUNTIME KNOBS ---

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Knob {
    Lock,
    LoadLow(usize),
    LoadHigh(usize),
    BoundFreq,
    TransRq,
    TransLoadRq,
    HoldMs,
}

impl FromStr for Knob {
    type Err = ConfigError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let level = |rest: &str| rest.parse::<usize>().map_err(|_| ConfigError::UnknownKey(key.to_string()));
        match key {
            "lock" => Ok(Self::Lock),
            "bound_freq" => Ok(Self::BoundFreq),
            "trans_rq" => Ok(Self::TransRq),
            "trans_load_rq" => Ok(Self::TransLoadRq),
            "hold_ms" => Ok(Self::HoldMs),
            _ => {
                if let Some(rest) = key.strip_prefix("load_l") {
                    Ok(Self::LoadLow(level(rest)?))
                } else if let Some(rest) = key.strip_prefix("load_h") {
                    Ok(Self::LoadHigh(level(rest)?))
                } else {
                    Err(ConfigError::UnknownKey(key.to_string()))
                }
            }
        }
    }
}

impl fmt::Display for Knob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lock => write!(f, "lock"),
            Self::LoadLow(l) => write!(f, "load_l{}", l),
            Self::LoadHigh(l) => write!(f, "load_h{}", l),
            Self::BoundFreq => write!(f, "bound_freq"),
            Self::TransRq => write!(f, "trans_rq"),
            Self::TransLoadRq => write!(f, "trans_load_rq"),
            Self::HoldMs => write!(f, "hold_ms"),
        }
    }
}

pub fn parse_numeric(key: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse::<u64>().map_err(|_| ConfigError::NotNumeric {
        key: key.to_string(),
        value: raw.trim().to_string(),
    })
}

fn check_pct(key: &str, value: u64) -> Result<u32, ConfigError> {
    if value > 100 {
        return Err(ConfigError::OutOfRange { key: key.to_string(), value, max: 100 });
    }
    Ok(value as u32)
}

fn check_u32(key: &str, value: u64) -> Result<u32, ConfigError> {
    u32::try_from(value).map_err(|_| ConfigError::OutOfRange {
        key: key.to_string(),
        value,
        max: u32::MAX as u64,
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tunables {
    pub table: ThresholdTable,
    pub policy: Policy,
    pub intervals: Intervals,
}

impl Tunables {
    pub fn keys(&self) -> Vec<Knob> {
        let n = self.table.len();
        let mut keys = Vec::with_capacity(2 * n + 4);
        for level in 0..n {
            keys.push(Knob::LoadLow(level));
            keys.push(Knob::LoadHigh(level));
        }
        keys.extend([Knob::BoundFreq, Knob::TransRq, Knob::TransLoadRq, Knob::HoldMs]);
        keys
    }

    fn level(&self, knob: Knob, level: usize) -> Result<usize, ConfigError> {
        if level < self.table.len() { Ok(level) } else { Err(ConfigError::UnknownKey(knob.to_string())) }
    }

    pub fn get(&self, knob: Knob) -> Result<u64, ConfigError> {
        let bands = self.table.bands();
        match knob {
            Knob::Lock => Err(ConfigError::UnknownKey(knob.to_string())),
            Knob::LoadLow(l) => Ok(bands[self.level(knob, l)?].low as u64),
            Knob::LoadHigh(l) => Ok(bands[self.level(knob, l)?].high as u64),
            Knob::BoundFreq => Ok(self.policy.freq_floor_khz as u64),
            Knob::TransRq => Ok(self.policy.trans_rq),
            Knob::TransLoadRq => Ok(self.policy.trans_load_rq as u64),
            Knob::HoldMs => Ok(self.policy.hold.as_millis() as u64),
        }
    }

    // VALIDATE FULLY BEFORE TOUCHING ANYTHING: A REJECTED WRITE CHANGES NOTHING
    pub fn set(&mut self, knob: Knob, raw: &str) -> Result<(), ConfigError> {
        let key = knob.to_string();
        let value = parse_numeric(&key, raw)?;
        let last = self.table.len() - 1;
        match knob {
            Knob::Lock => return Err(ConfigError::UnknownKey(key)),
            Knob::LoadLow(l) => {
                let l = self.level(knob, l)?;
                if l == 0 {
                    return Err(ConfigError::ReadOnly(key));
                }
                let pct = check_pct(&key, value)?;
                self.table.set_low(l, pct);
            }
            Knob::LoadHigh(l) => {
                let l = self.level(knob, l)?;
                if l == last {
                    return Err(ConfigError::ReadOnly(key));
                }
                let pct = check_pct(&key, value)?;
                self.table.set_high(l, pct);
            }
            Knob::BoundFreq => self.policy.freq_floor_khz = check_u32(&key, value)?,
            Knob::TransRq => self.policy.trans_rq = value,
            Knob::TransLoadRq => self.policy.trans_load_rq = check_pct(&key, value)?,
            Knob::HoldMs => self.policy.hold = Duration::from_millis(value),
        }
        Ok(())
    }
}
