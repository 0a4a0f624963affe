// HOTPLUGD ERROR TYPES
// LIBRARY ERRORS ARE TYPED. THE BINARY WRAPS THEM IN anyhow AT THE EDGE.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HotplugError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    #[error("no valid cpufreq frequency table")]
    NoFrequencyTable,

    #[error("cpu0 is never hotplugged")]
    Cpu0,

    #[error("cpu{0} is not a possible cpu")]
    NoSuchCpu(usize),

    #[error("control socket {path}: {source}")]
    Socket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn {0} thread: {1}")]
    Spawn(&'static str, #[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// CONFIGURATION WRITES: EVERY VARIANT LEAVES THE PRIOR VALUE IN PLACE
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown key: {0}")]
    UnknownKey(String),

    #[error("{key}: not a number: {value:?}")]
    NotNumeric { key: String, value: String },

    #[error("{key}: {value} out of range (max {max})")]
    OutOfRange { key: String, value: u64, max: u64 },

    #[error("{0} is read-only")]
    ReadOnly(String),

    #[error("failed to read config {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, HotplugError>;
