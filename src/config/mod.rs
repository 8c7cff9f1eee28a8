//! Typed configuration: the flat `key = value` file, typed defaults,
//! deprecated-key migration, and the runtime override overlay.
//!
//! The on-disk format is not YAML/JSON - it's the same `key = value` lines
//! the dCache HSM plugin and the tape-archival ecosystem already use - so
//! parsing is hand-rolled rather than a `serde` derive over the file itself.
//! [`schema`] is the single source of truth for which keys exist, their
//! [`schema::ValueKind`], and whether the runtime override may touch them.

pub mod schema;

mod overlay;

pub use overlay::{OverrideError, OverrideState};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use schema::{threshold_key, ValueKind, THRESHOLD_COUNT};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: malformed line (expected `key = value`): {text:?}")]
    Malformed {
        path: PathBuf,
        line: usize,
        text: String,
    },
    #[error("{path}:{line}: unknown or obsolete config key {key:?}")]
    UnknownKey {
        path: PathBuf,
        line: usize,
        key: String,
    },
    #[error("invalid value {value:?} for key {key:?}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: &'static str,
    },
    #[error("archiver threshold monotonicity violated: threshold{a}_usage ({a_val}) >= threshold{b}_usage ({b_val})")]
    ThresholdOrder {
        a: usize,
        a_val: u64,
        b: usize,
        b_val: u64,
    },
    #[error("key {key:?} may not be set via runtime override")]
    NotOverridable { key: String },
}

/// One GiB in bytes. Threshold keys are authored in GiB but stored in bytes
/// internally, matching "the implementation measures in bytes but the
/// user-facing unit is GiB" (SPEC_FULL §4.2).
pub const GIB: u64 = 1024 * 1024 * 1024;

/// The 1..9 archiver threshold ladder, byte-valued, with index 0 pinned at
/// zero so ramp-down arithmetic never special-cases the floor (SPEC_FULL
/// §4.1, §9).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArchiverThresholds([Option<u64>; THRESHOLD_COUNT + 1]);

impl ArchiverThresholds {
    /// Byte threshold for level `i` (1..=9), or `None` if undefined. Level 0
    /// is always defined as 0.
    pub fn get(&self, i: usize) -> Option<u64> {
        if i == 0 {
            Some(0)
        } else {
            self.0.get(i).copied().flatten()
        }
    }

    fn set(&mut self, i: usize, bytes: u64) {
        self.0[i] = Some(bytes);
    }

    /// Validates `threshold_i_usage < threshold_{i+1}_usage` for every
    /// consecutive pair of *defined* levels (SPEC_FULL §4.1, §8 invariant 6).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut last: Option<(usize, u64)> = None;
        for i in 1..=THRESHOLD_COUNT {
            let Some(v) = self.get(i) else { continue };
            if let Some((pa, pv)) = last {
                if pv >= v {
                    return Err(ConfigError::ThresholdOrder {
                        a: pa,
                        a_val: pv,
                        b: i,
                        b_val: v,
                    });
                }
            }
            last = Some((i, v));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub dir: PathBuf,
    pub logdir: PathBuf,
    pub statsdir: PathBuf,
    pub hsm: String,
    pub dsmcopts: String,
    pub dsmc_display_opts: String,
    pub dsmc_cpulimit: u64,
    pub sleeptime: u64,
    pub stale_age: u64,
    pub override_file: Option<PathBuf>,
    pub archiver_timeout: u64,
    pub archiver_retrytimeout: u64,
    pub archiver_thresholds: ArchiverThresholds,
    pub retriever_maxworkers: u32,
    pub retriever_remountdelay: u64,
    pub retriever_reqlistfillwait: u64,
    pub retriever_reqlistfillwaitmax: u64,
    pub retriever_buffersize: u64,
    pub retriever_backlogthreshold: u32,
    pub retriever_killthreshold: u32,
    pub retriever_hintfile: Option<PathBuf>,
    pub deleter_queueprocinterval: String,
    pub deleter_debug: bool,
    /// The effective `key = value` map this config was built from, post
    /// default-fill. Kept only so the override overlay can log a readable
    /// added/removed/changed diff; never reparsed.
    effective: BTreeMap<String, String>,
}

impl Config {
    pub fn out_dir(&self) -> PathBuf {
        self.dir.join("out")
    }

    pub fn in_dir(&self) -> PathBuf {
        self.dir.join("in")
    }

    pub fn request_dir(&self) -> PathBuf {
        self.dir.join("request")
    }

    pub fn requestlists_dir(&self) -> PathBuf {
        self.dir.join("requestlists")
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.dir.join("trash")
    }

    pub fn trash_queue_dir(&self) -> PathBuf {
        self.trash_dir().join("queue")
    }

    pub fn trash_debug_dir(&self) -> PathBuf {
        self.trash_dir().join("debug")
    }

    /// Reads and validates the config file at `path`, applying typed
    /// defaults and migrating deprecated keys (SPEC_FULL §4.1).
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = parse_kv_file(path)?;
        build(raw)
    }

    /// A key/value rendering of every documented key at its default or
    /// currently-loaded value. Used only by `#[cfg(test)]` assertions that
    /// every key in [`schema::KEYS`] round-trips through [`Config::from_file`]
    /// (SPEC_FULL §4.8); this crate exposes no standalone generator binary.
    pub fn default_text() -> String {
        let defaults = default_raw();
        let mut out = String::new();
        for key in &defaults {
            out.push_str(&format!("{} = {}\n", key.0, key.1));
        }
        out
    }

    pub(crate) fn effective_raw(&self) -> &BTreeMap<String, String> {
        &self.effective
    }
}

/// Lines starting with `#` or `;`, and blank lines, are ignored. Everything
/// else must be `key = value`.
fn parse_kv_file(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_kv_text(path, &text)
}

fn parse_kv_text(path: &Path, text: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut raw = BTreeMap::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::Malformed {
                path: path.to_path_buf(),
                line: idx + 1,
                text: line.to_string(),
            });
        };
        let key = key.trim();
        let value = value.trim();

        let resolved = match schema::resolve_deprecated(key) {
            Some(new_name) => {
                warn!(old = key, new = new_name, "config key is deprecated, migrating");
                new_name
            },
            None => key,
        };

        if schema::find(resolved).is_none() {
            return Err(ConfigError::UnknownKey {
                path: path.to_path_buf(),
                line: idx + 1,
                key: key.to_string(),
            });
        }

        raw.insert(resolved.to_string(), value.to_string());
    }
    Ok(raw)
}

fn default_raw() -> BTreeMap<String, String> {
    let mut d = BTreeMap::new();
    d.insert("dir".into(), "/var/spool/endit".into());
    d.insert("logdir".into(), "/var/log/endit".into());
    d.insert("statsdir".into(), "/run/endit".into());
    d.insert("hsm".into(), "endit".into());
    d.insert("dsmcopts".into(), String::new());
    d.insert("dsmc_display_opts".into(), String::new());
    d.insert("dsmc_cpulimit".into(), "172800".into());
    d.insert("sleeptime".into(), "60".into());
    d.insert("stale_age".into(), (7 * 24 * 3600).to_string());
    d.insert("archiver_timeout".into(), "21600".into());
    d.insert("archiver_retrytimeout".into(), "3600".into());
    d.insert("retriever_maxworkers".into(), "1".into());
    d.insert("retriever_remountdelay".into(), "300".into());
    d.insert("retriever_reqlistfillwait".into(), "600".into());
    d.insert("retriever_reqlistfillwaitmax".into(), "3600".into());
    d.insert("retriever_buffersize".into(), (1000 * GIB).to_string());
    d.insert("retriever_backlogthreshold".into(), "10".into());
    d.insert("retriever_killthreshold".into(), "95".into());
    d.insert("deleter_queueprocinterval".into(), "hourly".into());
    d.insert("deleter_debug".into(), "false".into());
    d
}

/// Applies `raw` on top of [`default_raw`] and constructs a typed [`Config`].
/// Shared by the initial file load and the override overlay so both paths
/// apply exactly the same type coercion and threshold validation.
fn build(raw: BTreeMap<String, String>) -> Result<Config, ConfigError> {
    let mut effective = default_raw();
    effective.extend(raw);

    let get = |key: &str| effective.get(key).map(String::as_str).unwrap_or("");

    let parse_posint = |key: &str| -> Result<u64, ConfigError> {
        typed(key, get(key), ValueKind::PosInt)?.as_posint()
    };
    let parse_u32 = |key: &str| -> Result<u32, ConfigError> {
        Ok(parse_posint(key)?.try_into().unwrap_or(u32::MAX))
    };
    let parse_bool = |key: &str| -> Result<bool, ConfigError> {
        typed(key, get(key), ValueKind::Bool)?.as_bool()
    };

    let mut thresholds = ArchiverThresholds::default();
    for i in 1..=THRESHOLD_COUNT {
        let key = threshold_key(i);
        if let Some(v) = effective.get(&key) {
            let gib = typed(&key, v, ValueKind::Int)?.as_int()?;
            if gib > 0 {
                thresholds.set(i, (gib as u64).saturating_mul(GIB));
            }
        }
    }
    thresholds.validate()?;

    let hintfile = effective
        .get("retriever_hintfile")
        .filter(|s| !s.is_empty())
        .map(PathBuf::from);
    let override_file = effective
        .get("override_file")
        .filter(|s| !s.is_empty())
        .map(PathBuf::from);

    Ok(Config {
        dir: PathBuf::from(get("dir")),
        logdir: PathBuf::from(get("logdir")),
        statsdir: PathBuf::from(get("statsdir")),
        hsm: get("hsm").to_string(),
        dsmcopts: get("dsmcopts").to_string(),
        dsmc_display_opts: get("dsmc_display_opts").to_string(),
        dsmc_cpulimit: parse_posint("dsmc_cpulimit")?,
        sleeptime: parse_posint("sleeptime")?,
        stale_age: parse_posint("stale_age")?,
        override_file,
        archiver_timeout: parse_posint("archiver_timeout")?,
        archiver_retrytimeout: parse_posint("archiver_retrytimeout")?,
        archiver_thresholds: thresholds,
        retriever_maxworkers: parse_u32("retriever_maxworkers")?,
        retriever_remountdelay: parse_posint("retriever_remountdelay")?,
        retriever_reqlistfillwait: parse_posint("retriever_reqlistfillwait")?,
        retriever_reqlistfillwaitmax: parse_posint("retriever_reqlistfillwaitmax")?,
        retriever_buffersize: parse_posint("retriever_buffersize")?,
        retriever_backlogthreshold: parse_u32("retriever_backlogthreshold")?,
        retriever_killthreshold: parse_u32("retriever_killthreshold")?,
        retriever_hintfile: hintfile,
        deleter_queueprocinterval: get("deleter_queueprocinterval").to_string(),
        deleter_debug: parse_bool("deleter_debug")?,
        effective,
    })
}

enum Typed {
    Str(String),
    PosInt(u64),
    Int(i64),
    Bool(bool),
}

impl Typed {
    fn as_posint(self) -> Result<u64, ConfigError> {
        match self {
            Typed::PosInt(v) => Ok(v),
            _ => unreachable!("typed() only returns the requested kind"),
        }
    }

    fn as_int(self) -> Result<i64, ConfigError> {
        match self {
            Typed::Int(v) => Ok(v),
            _ => unreachable!("typed() only returns the requested kind"),
        }
    }

    fn as_bool(self) -> Result<bool, ConfigError> {
        match self {
            Typed::Bool(v) => Ok(v),
            _ => unreachable!("typed() only returns the requested kind"),
        }
    }
}

/// `reqint`/`reqposint` validators from SPEC_FULL §4.1: parse `value` as the
/// declared [`ValueKind`] for `key`, rejecting malformed or out-of-range
/// text.
fn typed(key: &str, value: &str, kind: ValueKind) -> Result<Typed, ConfigError> {
    match kind {
        ValueKind::Str => Ok(Typed::Str(value.to_string())),
        ValueKind::PosInt => value
            .parse::<u64>()
            .map(Typed::PosInt)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
                reason: "expected a non-negative integer",
            }),
        ValueKind::Int => value
            .parse::<i64>()
            .map(Typed::Int)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
                reason: "expected an integer",
            }),
        ValueKind::Bool => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(Typed::Bool(true)),
            "0" | "false" | "no" | "" => Ok(Typed::Bool(false)),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
                reason: "expected true/false/yes/no/1/0",
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_cleanly() {
        let cfg = build(BTreeMap::new()).unwrap();
        assert_eq!(cfg.sleeptime, 60);
        assert_eq!(cfg.archiver_timeout, 21600);
        assert_eq!(cfg.retriever_buffersize, 1000 * GIB);
        assert!(cfg.archiver_thresholds.get(1).is_none());
    }

    #[test]
    fn default_text_round_trips() {
        let text = Config::default_text();
        let raw = parse_kv_text(Path::new("<default_text>"), &text).unwrap();
        let cfg = build(raw).unwrap();
        assert_eq!(cfg.sleeptime, 60);
    }

    #[test]
    fn unknown_key_rejected() {
        let path = Path::new("<test>");
        let err = parse_kv_text(path, "bogus_key = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey { .. }));
    }

    #[test]
    fn deprecated_key_migrates() {
        let path = Path::new("<test>");
        let raw = parse_kv_text(path, "threshold1 = 500\n").unwrap();
        assert!(raw.contains_key("archiver_threshold1_usage"));
        assert!(!raw.contains_key("threshold1"));
    }

    #[test]
    fn threshold_monotonicity_enforced() {
        let mut raw = BTreeMap::new();
        raw.insert("archiver_threshold1_usage".into(), "500".into());
        raw.insert("archiver_threshold2_usage".into(), "500".into());
        let err = build(raw).unwrap_err();
        assert!(matches!(err, ConfigError::ThresholdOrder { .. }));
    }

    #[test]
    fn threshold_gib_converted_to_bytes() {
        let mut raw = BTreeMap::new();
        raw.insert("archiver_threshold1_usage".into(), "2".into());
        let cfg = build(raw).unwrap();
        assert_eq!(cfg.archiver_thresholds.get(1), Some(2 * GIB));
        assert_eq!(cfg.archiver_thresholds.get(0), Some(0));
    }

    #[test]
    fn malformed_line_rejected() {
        let path = Path::new("<test>");
        let err = parse_kv_text(path, "not a kv line\n").unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }));
    }
}
