//! The typed key schema for the flat `key = value` configuration file.
//!
//! Every recognized key carries a [`ValueKind`] (how to parse and validate
//! its text), a `canoverride` flag (whether the runtime override file is
//! allowed to touch it), and lives in [`KEYS`]. Keys not in this table are a
//! hard startup error; keys in [`DEPRECATED`] are rewritten to their
//! replacement with a warning rather than rejected.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValueKind {
    /// Free-text string (paths, dsmc option strings, schedule specs).
    Str,
    /// A non-negative integer (`reqposint` in SPEC_FULL §4.1).
    PosInt,
    /// Any integer (`reqint`), used for thresholds that may be disabled.
    Int,
    /// `true`/`false`/`1`/`0`/`yes`/`no`.
    Bool,
}

pub struct KeySpec {
    pub name: &'static str,
    pub kind: ValueKind,
    pub canoverride: bool,
}

/// Archiver threshold keys are named `archiver_threshold1_usage` through
/// `archiver_threshold9_usage` rather than listed individually here.
pub const THRESHOLD_COUNT: usize = 9;

pub fn threshold_key(i: usize) -> String {
    format!("archiver_threshold{i}_usage")
}

pub const KEYS: &[KeySpec] = &[
    KeySpec { name: "dir", kind: ValueKind::Str, canoverride: false },
    KeySpec { name: "logdir", kind: ValueKind::Str, canoverride: false },
    KeySpec { name: "statsdir", kind: ValueKind::Str, canoverride: false },
    KeySpec { name: "hsm", kind: ValueKind::Str, canoverride: false },
    KeySpec { name: "dsmcopts", kind: ValueKind::Str, canoverride: true },
    KeySpec { name: "dsmc_display_opts", kind: ValueKind::Str, canoverride: true },
    KeySpec { name: "dsmc_cpulimit", kind: ValueKind::PosInt, canoverride: true },
    KeySpec { name: "sleeptime", kind: ValueKind::PosInt, canoverride: true },
    KeySpec { name: "stale_age", kind: ValueKind::PosInt, canoverride: false },
    KeySpec { name: "override_file", kind: ValueKind::Str, canoverride: false },
    // archiver
    KeySpec { name: "archiver_timeout", kind: ValueKind::PosInt, canoverride: true },
    KeySpec { name: "archiver_retrytimeout", kind: ValueKind::PosInt, canoverride: true },
    KeySpec { name: "archiver_threshold1_usage", kind: ValueKind::Int, canoverride: true },
    KeySpec { name: "archiver_threshold2_usage", kind: ValueKind::Int, canoverride: true },
    KeySpec { name: "archiver_threshold3_usage", kind: ValueKind::Int, canoverride: true },
    KeySpec { name: "archiver_threshold4_usage", kind: ValueKind::Int, canoverride: true },
    KeySpec { name: "archiver_threshold5_usage", kind: ValueKind::Int, canoverride: true },
    KeySpec { name: "archiver_threshold6_usage", kind: ValueKind::Int, canoverride: true },
    KeySpec { name: "archiver_threshold7_usage", kind: ValueKind::Int, canoverride: true },
    KeySpec { name: "archiver_threshold8_usage", kind: ValueKind::Int, canoverride: true },
    KeySpec { name: "archiver_threshold9_usage", kind: ValueKind::Int, canoverride: true },
    // retriever
    KeySpec { name: "retriever_maxworkers", kind: ValueKind::PosInt, canoverride: true },
    KeySpec { name: "retriever_remountdelay", kind: ValueKind::PosInt, canoverride: true },
    KeySpec { name: "retriever_reqlistfillwait", kind: ValueKind::PosInt, canoverride: true },
    KeySpec { name: "retriever_reqlistfillwaitmax", kind: ValueKind::PosInt, canoverride: true },
    KeySpec { name: "retriever_buffersize", kind: ValueKind::PosInt, canoverride: true },
    KeySpec { name: "retriever_backlogthreshold", kind: ValueKind::PosInt, canoverride: true },
    KeySpec { name: "retriever_killthreshold", kind: ValueKind::PosInt, canoverride: true },
    KeySpec { name: "retriever_hintfile", kind: ValueKind::Str, canoverride: false },
    // deleter
    KeySpec { name: "deleter_queueprocinterval", kind: ValueKind::Str, canoverride: true },
    KeySpec { name: "deleter_debug", kind: ValueKind::Bool, canoverride: false },
];

/// Deprecated key names, mapped to their replacement. Config load rewrites
/// these with a warning rather than rejecting them outright.
pub const DEPRECATED: &[(&str, &str)] = &[
    ("threshold1", "archiver_threshold1_usage"),
    ("threshold2", "archiver_threshold2_usage"),
    ("maxretrievers", "retriever_maxworkers"),
    ("remountdelay", "retriever_remountdelay"),
    ("queueprocinterval", "deleter_queueprocinterval"),
];

pub fn find(name: &str) -> Option<&'static KeySpec> {
    KEYS.iter().find(|k| k.name == name)
}

pub fn resolve_deprecated(name: &str) -> Option<&'static str> {
    DEPRECATED
        .iter()
        .find(|(old, _)| *old == name)
        .map(|(_, new)| *new)
}
