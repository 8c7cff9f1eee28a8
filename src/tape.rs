//! Tape-client argument builders and opaque-output classification
//! (SPEC_FULL §6, §9 "Opaque external command output").
//!
//! The tape client's exit code is coarse; the authoritative signal is lines
//! matching `^AN\w\d\d\d\d\w` in its combined stdout/stderr. We mine that
//! text for codes against a small per-component whitelist and never parse
//! totals or counters out of it.

use std::sync::OnceLock;

use regex::Regex;

fn error_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^AN\w\d{4}\w").unwrap())
}

fn already_deleted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // The deleter's one documented shape: `ANS1345E ... '<absolute path>'`,
    // single-quoted. If a future client changes this, the line falls
    // through to `Code::Unclassified` rather than being guessed at
    // (SPEC_FULL §9 open question).
    RE.get_or_init(|| Regex::new(r"ANS1345E.*'([^']+)'").unwrap())
}

/// Splits a `dsmcopts`-style string on whitespace. The config format has no
/// quoting convention of its own (each option is already a single token
/// like `-se=server1`), so this is intentionally simple.
pub fn split_opts(opts: &str) -> Vec<String> {
    opts.split_whitespace().map(str::to_string).collect()
}

/// `archive -deletefiles <base opts> -description=<string> -filelist=<path>`
/// (SPEC_FULL §4.2, §6).
pub fn archive_args(base_opts: &str, description: &str, filelist: &str) -> Vec<String> {
    let mut args = vec!["archive".to_string(), "-deletefiles".to_string()];
    args.extend(split_opts(base_opts));
    args.push(format!("-description={description}"));
    args.push(format!("-filelist={filelist}"));
    args
}

/// `retrieve -replace=no -followsymbolic=yes <display opts> <base opts>
/// -filelist=<path> <indir>/` (SPEC_FULL §4.3, §6).
pub fn retrieve_args(
    display_opts: &str,
    base_opts: &str,
    filelist: &str,
    in_dir: &str,
) -> Vec<String> {
    let mut args = vec![
        "retrieve".to_string(),
        "-replace=no".to_string(),
        "-followsymbolic=yes".to_string(),
    ];
    args.extend(split_opts(display_opts));
    args.extend(split_opts(base_opts));
    args.push(format!("-filelist={filelist}"));
    args.push(format!("{}/", in_dir.trim_end_matches('/')));
    args
}

/// `delete archive -noprompt <display opts> <base opts> -filelist=<path>`
/// (SPEC_FULL §4.4, §6).
pub fn delete_args(display_opts: &str, base_opts: &str, filelist: &str) -> Vec<String> {
    let mut args = vec!["delete".to_string(), "archive".to_string(), "-noprompt".to_string()];
    args.extend(split_opts(display_opts));
    args.extend(split_opts(base_opts));
    args.push(format!("-filelist={filelist}"));
    args
}

/// A classified `AN\w\d\d\d\d\w` line from tape-client output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Code {
    /// `ANS1278W`, `ANS1898I` - logged, but never change outcome.
    Benign(String),
    /// `ANS1302E` - no objects matched the query; the whole batch was
    /// already deleted.
    NoObjectsMatched,
    /// `ANS1345E ... '<path>'` - single object already deleted; the
    /// basename of the captured path.
    AlreadyDeleted(String),
    /// Any other `AN\w\d\d\d\d\w` code; marks the whole invocation failed.
    Unclassified(String),
}

const BENIGN_CODES: &[&str] = &["ANS1278W", "ANS1898I"];

/// Scans `text` line by line for `AN\w\d\d\d\d\w` codes and classifies each
/// per the deleter's whitelist (SPEC_FULL §4.4).
pub fn scan(text: &str) -> Vec<Code> {
    let mut out = Vec::new();
    for line in text.lines() {
        let Some(m) = error_code_re().find(line) else { continue };
        let code = m.as_str().to_string();

        if BENIGN_CODES.contains(&code.as_str()) {
            out.push(Code::Benign(code));
        } else if code == "ANS1302E" {
            out.push(Code::NoObjectsMatched);
        } else if code == "ANS1345E" {
            match already_deleted_re().captures(line) {
                Some(cap) => {
                    let path = &cap[1];
                    let basename = path.rsplit('/').next().unwrap_or(path);
                    out.push(Code::AlreadyDeleted(basename.to_string()));
                },
                None => out.push(Code::Unclassified(line.to_string())),
            }
        } else {
            out.push(Code::Unclassified(line.to_string()));
        }
    }
    out
}

/// Raw matching lines, for the archiver/retriever's coarser "log it and
/// retry" handling (they don't attempt a deleter-style partial-success
/// parse; SPEC_FULL §4.2/§4.3 only log these).
pub fn error_lines(text: &str) -> Vec<&str> {
    text.lines().filter(|l| error_code_re().is_match(l)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_args_shape() {
        let args = archive_args("-se=server1", "ENDIT-2026-07-28T00:00:00", "/tmp/list");
        assert_eq!(
            args,
            vec![
                "archive",
                "-deletefiles",
                "-se=server1",
                "-description=ENDIT-2026-07-28T00:00:00",
                "-filelist=/tmp/list",
            ]
        );
    }

    #[test]
    fn retrieve_args_shape() {
        let args = retrieve_args("-tapeprompt=no", "-se=server1", "/tmp/list", "/pool/in");
        assert_eq!(
            args,
            vec![
                "retrieve",
                "-replace=no",
                "-followsymbolic=yes",
                "-tapeprompt=no",
                "-se=server1",
                "-filelist=/tmp/list",
                "/pool/in/",
            ]
        );
    }

    #[test]
    fn classifies_benign_and_no_objects_matched() {
        let text = "ANS1278W\nsome noise\nANS1302E No objects on server match query\n";
        let codes = scan(text);
        assert_eq!(codes, vec![Code::Benign("ANS1278W".into()), Code::NoObjectsMatched]);
    }

    #[test]
    fn classifies_already_deleted_with_basename() {
        let text = "ANS1345E Object '/pool/out/deadbeef' already deleted";
        let codes = scan(text);
        assert_eq!(codes, vec![Code::AlreadyDeleted("deadbeef".into())]);
    }

    #[test]
    fn unrecognized_quote_shape_falls_back_to_unclassified() {
        let text = "ANS1345E Object deadbeef already deleted";
        let codes = scan(text);
        assert_eq!(codes, vec![Code::Unclassified(text.trim().to_string())]);
    }

    #[test]
    fn unknown_code_is_unclassified() {
        let text = "ANS9999E Something went wrong";
        let codes = scan(text);
        assert_eq!(codes, vec![Code::Unclassified(text.to_string())]);
    }

    #[test]
    fn error_lines_picks_up_any_code() {
        let text = "all fine\nANS4000E disk full\n";
        assert_eq!(error_lines(text), vec!["ANS4000E disk full"]);
    }

    #[test]
    fn embedded_code_mid_line_is_not_misclassified() {
        let text = "removing /data/XANS1345Exyz from staging\n";
        assert!(scan(text).is_empty());
        assert!(error_lines(text).is_empty());
    }
}
