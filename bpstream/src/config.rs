//! Engine and transport options, parsed once from string parameters.

use std::path::PathBuf;
use std::time::Duration;

use crate::transport::TransportKind;
use crate::types::Params;
use crate::{Error, Result};

/// What to do with keys no option table recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigMode {
    #[default]
    Lenient,
    Strict,
}

struct OptionDef<C> {
    key: &'static str,
    default: &'static str,
    apply: fn(&mut C, &str) -> Result<()>,
}

fn invalid(key: &str, value: &str, expected: &str) -> Error {
    Error::InvalidArgument(format!(
        "value '{}' for parameter {} is invalid, expected {}",
        value, key, expected
    ))
}

pub(crate) fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(invalid(key, value, "on or off")),
    }
}

fn parse_uint(key: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| invalid(key, value, "a non-negative integer"))
}

/// Byte sizes with an optional `kb`/`mb`/`gb` suffix.
pub(crate) fn parse_size(key: &str, value: &str) -> Result<u64> {
    let lower = value.to_ascii_lowercase();
    let (digits, unit) = match lower.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => lower.split_at(split),
        None => (lower.as_str(), ""),
    };

    let multiplier: u64 = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        _ => return Err(invalid(key, value, "a size such as 4096, 16Kb or 1Mb")),
    };

    parse_uint(key, digits)?
        .checked_mul(multiplier)
        .ok_or_else(|| invalid(key, value, "a size that fits in 64 bits"))
}

fn apply_options<C>(
    table: &[OptionDef<C>],
    target: &mut C,
    params: &Params,
    mode: ConfigMode,
) -> Result<()> {
    for (key, value) in params {
        let lower = key.to_ascii_lowercase();
        match table.iter().find(|option| option.key == lower) {
            Some(option) => (option.apply)(target, value.trim())?,
            None => match mode {
                ConfigMode::Strict => {
                    return Err(Error::InvalidArgument(format!(
                        "parameter {} is not recognized",
                        key
                    )))
                }
                ConfigMode::Lenient => {
                    tracing::warn!(parameter = %key, "ignoring unrecognized parameter")
                }
            },
        }
    }
    Ok(())
}

fn apply_defaults<C>(table: &[OptionDef<C>], target: &mut C) {
    for option in table {
        // Defaults are constants covered by tests.
        let _ = (option.apply)(target, option.default);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub verbosity: u8,
    pub collective_metadata: bool,
    pub profile: bool,
    pub aggregator_rank: usize,
    pub initial_buffer_size: usize,
    pub step_wait: Duration,
}

const ENGINE_OPTIONS: &[OptionDef<EngineConfig>] = &[
    OptionDef {
        key: "verbose",
        default: "0",
        apply: |c, v| {
            let level = parse_uint("verbose", v)?;
            if level > 5 {
                return Err(invalid("verbose", v, "an integer in the range [0,5]"));
            }
            c.verbosity = level as u8;
            Ok(())
        },
    },
    OptionDef {
        key: "collectivemetadata",
        default: "on",
        apply: |c, v| {
            c.collective_metadata = parse_bool("collectivemetadata", v)?;
            Ok(())
        },
    },
    OptionDef {
        key: "profile",
        default: "on",
        apply: |c, v| {
            c.profile = parse_bool("profile", v)?;
            Ok(())
        },
    },
    OptionDef {
        key: "aggregatorrank",
        default: "0",
        apply: |c, v| {
            c.aggregator_rank = parse_uint("aggregatorrank", v)? as usize;
            Ok(())
        },
    },
    OptionDef {
        key: "initialbuffersize",
        default: "16Kb",
        apply: |c, v| {
            c.initial_buffer_size = parse_size("initialbuffersize", v)? as usize;
            Ok(())
        },
    },
    OptionDef {
        key: "stepwaitms",
        default: "1",
        apply: |c, v| {
            c.step_wait = Duration::from_millis(parse_uint("stepwaitms", v)?);
            Ok(())
        },
    },
];

impl Default for EngineConfig {
    fn default() -> Self {
        let mut config = EngineConfig {
            verbosity: 0,
            collective_metadata: false,
            profile: false,
            aggregator_rank: 0,
            initial_buffer_size: 0,
            step_wait: Duration::ZERO,
        };
        apply_defaults(ENGINE_OPTIONS, &mut config);
        config
    }
}

impl EngineConfig {
    pub fn from_params(params: &Params, mode: ConfigMode) -> Result<EngineConfig> {
        let mut config = EngineConfig::default();
        apply_options(ENGINE_OPTIONS, &mut config, params, mode)?;
        Ok(config)
    }

    /// True when every engine call should be traced.
    #[inline]
    pub(crate) fn trace_calls(&self) -> bool {
        self.verbosity >= 5
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Fixed size of a shared-memory segment. Required when creating one.
    pub capacity: Option<u64>,
    pub remove_on_close: bool,
    pub shm_dir: PathBuf,
    pub async_hint: bool,
}

fn default_shm_dir() -> PathBuf {
    let dev_shm = PathBuf::from("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm
    } else {
        std::env::temp_dir()
    }
}

const TRANSPORT_OPTIONS: &[OptionDef<TransportConfig>] = &[
    OptionDef {
        key: "transport",
        default: "file",
        apply: |c, v| {
            c.kind = match v.to_ascii_lowercase().as_str() {
                "file" | "posix" | "fstream" => TransportKind::File,
                "shm" | "sharedmemory" | "shm_systemv" => TransportKind::SharedMemory,
                _ => return Err(invalid("transport", v, "file or shm")),
            };
            Ok(())
        },
    },
    OptionDef {
        key: "capacity",
        default: "0",
        apply: |c, v| {
            let capacity = parse_size("capacity", v)?;
            c.capacity = if capacity == 0 { None } else { Some(capacity) };
            Ok(())
        },
    },
    OptionDef {
        key: "removeonclose",
        default: "off",
        apply: |c, v| {
            c.remove_on_close = parse_bool("removeonclose", v)?;
            Ok(())
        },
    },
    OptionDef {
        key: "shmdir",
        default: "",
        apply: |c, v| {
            c.shm_dir = if v.is_empty() {
                default_shm_dir()
            } else {
                PathBuf::from(v)
            };
            Ok(())
        },
    },
    OptionDef {
        key: "async",
        default: "off",
        apply: |c, v| {
            c.async_hint = parse_bool("async", v)?;
            Ok(())
        },
    },
];

impl Default for TransportConfig {
    fn default() -> Self {
        let mut config = TransportConfig {
            kind: TransportKind::File,
            capacity: None,
            remove_on_close: false,
            shm_dir: PathBuf::new(),
            async_hint: false,
        };
        apply_defaults(TRANSPORT_OPTIONS, &mut config);
        config
    }
}

impl TransportConfig {
    pub fn from_params(params: &Params, mode: ConfigMode) -> Result<TransportConfig> {
        let mut config = TransportConfig::default();
        apply_options(TRANSPORT_OPTIONS, &mut config, params, mode)?;
        Ok(config)
    }

    pub fn file() -> TransportConfig {
        TransportConfig::default()
    }

    pub fn shm(capacity: u64) -> TransportConfig {
        TransportConfig {
            kind: TransportKind::SharedMemory,
            capacity: Some(capacity),
            ..TransportConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.verbosity, 0);
        assert!(config.collective_metadata);
        assert!(config.profile);
        assert_eq!(config.aggregator_rank, 0);
        assert_eq!(config.initial_buffer_size, 16 * 1024);
        assert_eq!(config.step_wait, Duration::from_millis(1));

        for option in ENGINE_OPTIONS {
            let mut c = EngineConfig::default();
            (option.apply)(&mut c, option.default).unwrap();
        }
        for option in TRANSPORT_OPTIONS {
            let mut c = TransportConfig::default();
            (option.apply)(&mut c, option.default).unwrap();
        }
        assert_eq!(TransportConfig::default().kind, TransportKind::File);
        assert_ne!(TransportConfig::default().shm_dir, PathBuf::new());
    }

    #[test]
    fn keys_are_case_insensitive() {
        let config = EngineConfig::from_params(
            &params(&[("Verbose", "5"), ("CollectiveMetadata", "Off"), ("profile", "false")]),
            ConfigMode::Strict,
        )
        .unwrap();
        assert_eq!(config.verbosity, 5);
        assert!(!config.collective_metadata);
        assert!(!config.profile);
        assert!(config.trace_calls());
    }

    #[test]
    fn verbosity_range() {
        for bad in ["6", "-1", "loud"] {
            let err =
                EngineConfig::from_params(&params(&[("verbose", bad)]), ConfigMode::Lenient)
                    .unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)), "{}", bad);
        }
    }

    #[test]
    fn unknown_keys_by_mode() {
        let p = params(&[("colour", "blue")]);
        assert!(EngineConfig::from_params(&p, ConfigMode::Lenient).is_ok());
        assert!(matches!(
            EngineConfig::from_params(&p, ConfigMode::Strict),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size("k", "4096").unwrap(), 4096);
        assert_eq!(parse_size("k", "16Kb").unwrap(), 16 * 1024);
        assert_eq!(parse_size("k", "2MB").unwrap(), 2 << 20);
        assert!(parse_size("k", "12 parsecs").is_err());
    }

    #[test]
    fn transport_params() {
        let config = TransportConfig::from_params(
            &params(&[
                ("Transport", "shm"),
                ("Capacity", "1Kb"),
                ("RemoveOnClose", "on"),
                ("ShmDir", "/tmp/segments"),
            ]),
            ConfigMode::Strict,
        )
        .unwrap();
        assert_eq!(config.kind, TransportKind::SharedMemory);
        assert_eq!(config.capacity, Some(1024));
        assert!(config.remove_on_close);
        assert_eq!(config.shm_dir, PathBuf::from("/tmp/segments"));

        assert!(TransportConfig::from_params(
            &params(&[("transport", "carrier-pigeon")]),
            ConfigMode::Lenient
        )
        .is_err());
    }
}
