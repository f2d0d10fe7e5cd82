use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Commands rejected outright in workspace mode (case-insensitive word match).
const BLOCKED_KEYWORDS: &[&str] = &["sudo", "su", "shutdown", "reboot", "halt", "poweroff"];

/// Shell constructs that defeat path analysis and are therefore rejected
/// wholesale in workspace mode.
const SUBSTITUTION_MARKERS: &[&str] = &["$(", "`", "${", "<(", ">("];

/// Raw policy shape as it appears in `companion.json` and API bodies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub roots: Vec<String>,
}

fn default_mode() -> String {
    "full".to_string()
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            roots: Vec::new(),
        }
    }
}

/// Normalized admission policy.
///
/// `Full` places no restrictions. `Workspace` carries an ordered, deduplicated
/// set of absolute roots; commands may only reference paths inside them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionPolicy {
    Full,
    Workspace { roots: Vec<PathBuf> },
}

impl PermissionPolicy {
    /// Normalize a raw policy. Unknown modes fall back to the more
    /// restrictive `workspace` unless `strict` is set, in which case they are
    /// rejected.
    pub fn normalize(raw: &PolicyConfig, strict: bool, home: &Path) -> Result<Self, PolicyError> {
        let mode = raw.mode.trim().to_lowercase();
        match mode.as_str() {
            "full" => Ok(Self::Full),
            "workspace" => Ok(Self::Workspace {
                roots: normalize_roots(&raw.roots, strict, home)?,
            }),
            other => {
                if strict {
                    Err(PolicyError::InvalidPolicy(format!(
                        "unknown permission mode '{other}'"
                    )))
                } else {
                    Ok(Self::Workspace {
                        roots: normalize_roots(&raw.roots, false, home)?,
                    })
                }
            }
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Workspace { .. } => "workspace",
        }
    }

    /// Wire/config representation.
    pub fn to_config(&self) -> PolicyConfig {
        match self {
            Self::Full => PolicyConfig {
                mode: "full".into(),
                roots: Vec::new(),
            },
            Self::Workspace { roots } => PolicyConfig {
                mode: "workspace".into(),
                roots: roots
                    .iter()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect(),
            },
        }
    }

    /// Admission check for a shell command string in workspace mode: keyword
    /// blocklist, substitution blocks, and per-token path containment. No-op
    /// under `Full`.
    pub fn enforce_command(
        &self,
        command: &str,
        cwd: &Path,
        home: &Path,
    ) -> Result<(), PolicyError> {
        let roots = match self {
            Self::Full => return Ok(()),
            Self::Workspace { roots } => roots,
        };

        let lower = command.to_lowercase();
        for keyword in BLOCKED_KEYWORDS {
            if contains_word(&lower, keyword) {
                return Err(PolicyError::Violation(format!(
                    "command contains blocked keyword '{keyword}'"
                )));
            }
        }
        if matches_rm_rf_root(&lower) {
            return Err(PolicyError::Violation(
                "recursive delete of the filesystem root is not allowed".into(),
            ));
        }
        for marker in SUBSTITUTION_MARKERS {
            if command.contains(marker) {
                return Err(PolicyError::Violation(format!(
                    "shell substitution '{marker}' is not allowed in workspace mode"
                )));
            }
        }

        for sub_command in split_subcommands(command) {
            for token in tokenize(&sub_command) {
                for candidate in candidates(&token) {
                    if candidate.contains("://") || !is_path_like(&candidate) {
                        continue;
                    }
                    let resolved = resolve_candidate(&candidate, cwd, home);
                    if !roots.iter().any(|root| resolved.starts_with(root)) {
                        return Err(PolicyError::Violation(format!(
                            "path '{}' is outside the allowed workspace",
                            resolved.display()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Pick and validate the working directory for a command: the requested
    /// one if present, else the first workspace root, else the daemon home.
    /// In workspace mode the chosen directory is canonicalized so symlinks
    /// cannot escape the roots.
    pub fn resolve_cwd(
        &self,
        requested: Option<&str>,
        home: &Path,
    ) -> Result<PathBuf, PolicyError> {
        let chosen: PathBuf = match requested.map(str::trim).filter(|s| !s.is_empty()) {
            Some(req) => expand_tilde(req, home),
            None => match self {
                Self::Workspace { roots } => roots.first().cloned().ok_or_else(|| {
                    PolicyError::Violation("workspace policy has no configured roots".into())
                })?,
                Self::Full => home.to_path_buf(),
            },
        };

        let meta = fs::metadata(&chosen).map_err(|err| {
            PolicyError::InvalidCwd(format!("'{}': {err}", chosen.display()))
        })?;
        if !meta.is_dir() {
            return Err(PolicyError::InvalidCwd(format!(
                "'{}' is not a directory",
                chosen.display()
            )));
        }

        if let Self::Workspace { roots } = self {
            let canonical = fs::canonicalize(&chosen).map_err(|err| {
                PolicyError::InvalidCwd(format!("'{}': {err}", chosen.display()))
            })?;
            let contained = roots.iter().any(|root| {
                fs::canonicalize(root)
                    .map(|canonical_root| canonical.starts_with(&canonical_root))
                    .unwrap_or(false)
            });
            if !contained {
                return Err(PolicyError::Violation(format!(
                    "working directory '{}' escapes the workspace",
                    canonical.display()
                )));
            }
            return Ok(canonical);
        }
        Ok(chosen)
    }
}

fn normalize_roots(
    roots: &[String],
    strict: bool,
    home: &Path,
) -> Result<Vec<PathBuf>, PolicyError> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for raw in roots {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        let expanded = expand_tilde(trimmed, home);
        if !expanded.is_absolute() {
            if strict {
                return Err(PolicyError::InvalidPolicy(format!(
                    "workspace root '{trimmed}' is not absolute"
                )));
            }
            continue;
        }
        let normalized = lexical_normalize(&expanded);
        if seen.insert(normalized.clone()) {
            out.push(normalized);
        }
    }
    Ok(out)
}

fn expand_tilde(input: &str, home: &Path) -> PathBuf {
    if input == "~" {
        home.to_path_buf()
    } else if let Some(rest) = input.strip_prefix("~/") {
        home.join(rest)
    } else {
        PathBuf::from(input)
    }
}

fn is_word_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

/// Case-sensitive word-boundary search; callers pass a lowercased haystack.
fn contains_word(haystack: &str, word: &str) -> bool {
    let bytes = haystack.as_bytes();
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(word) {
        let idx = start + pos;
        let end = idx + word.len();
        let before_ok = idx == 0 || !is_word_char(bytes[idx - 1]);
        let after_ok = end >= bytes.len() || !is_word_char(bytes[end]);
        if before_ok && after_ok {
            return true;
        }
        start = idx + 1;
    }
    false
}

/// `rm -rf /` where the trailing slash does not continue into a normal path
/// character (so `rm -rf /tmp/scratch` is left to path analysis).
fn matches_rm_rf_root(haystack: &str) -> bool {
    const NEEDLE: &str = "rm -rf /";
    let bytes = haystack.as_bytes();
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(NEEDLE) {
        let idx = start + pos;
        let before_ok = idx == 0 || !is_word_char(bytes[idx - 1]);
        let continues = bytes
            .get(idx + NEEDLE.len())
            .is_some_and(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
        if before_ok && !continues {
            return true;
        }
        start = idx + 1;
    }
    false
}

/// Split on unquoted `|`, `;` and `&&`. A lone `&` stays with its token.
fn split_subcommands(command: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = command.chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                '|' | ';' => parts.push(std::mem::take(&mut current)),
                '&' if chars.peek() == Some(&'&') => {
                    chars.next();
                    parts.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            },
        }
    }
    parts.push(current);
    parts
}

/// Whitespace tokenizer that keeps quoted runs (with their quotes) intact.
fn tokenize(sub_command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in sub_command.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                _ => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn strip_quotes(token: &str) -> &str {
    let bytes = token.as_bytes();
    if bytes.len() >= 2 && (bytes[0] == b'\'' || bytes[0] == b'"') && bytes[bytes.len() - 1] == bytes[0]
    {
        &token[1..token.len() - 1]
    } else {
        token
    }
}

/// The token itself, plus the value half of `KEY=value` assignments.
fn candidates(token: &str) -> Vec<String> {
    let stripped = strip_quotes(token);
    let mut out = vec![stripped.to_string()];
    if let Some(pos) = stripped.find('=') {
        if pos > 0 && pos + 1 < stripped.len() {
            out.push(strip_quotes(&stripped[pos + 1..]).to_string());
        }
    }
    out
}

fn has_drive_prefix(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn is_path_like(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    s.starts_with('.')
        || s == "~"
        || s.starts_with("~/")
        || s.starts_with('/')
        || has_drive_prefix(s)
        || s.contains('/')
        || s.contains('\\')
}

fn resolve_candidate(candidate: &str, cwd: &Path, home: &Path) -> PathBuf {
    let path = expand_tilde(candidate, home);
    let absolute = if path.is_absolute() {
        path
    } else {
        cwd.join(path)
    };
    lexical_normalize(&absolute)
}

/// Component-wise normalization without touching the filesystem: `..` pops,
/// `.` disappears. Non-existent paths can still be judged for containment.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(roots: &[&str]) -> PermissionPolicy {
        PermissionPolicy::Workspace {
            roots: roots.iter().map(PathBuf::from).collect(),
        }
    }

    fn home() -> PathBuf {
        PathBuf::from("/home/tester")
    }

    fn cwd() -> PathBuf {
        PathBuf::from("/tmp/ws")
    }

    #[test]
    fn full_mode_admits_everything() {
        let policy = PermissionPolicy::Full;
        policy
            .enforce_command("sudo rm -rf / $(cat /etc/shadow)", &cwd(), &home())
            .expect("full mode is a no-op");
    }

    #[test]
    fn keywords_are_rejected_on_word_boundaries() {
        let policy = workspace(&["/tmp/ws"]);
        for bad in [
            "sudo apt install x",
            "echo hi && reboot",
            "SHUTDOWN -h now",
            "su",
        ] {
            let err = policy.enforce_command(bad, &cwd(), &home()).unwrap_err();
            assert!(err.is_violation(), "{bad} should be rejected");
        }
        // Keyword embedded in a longer word is fine.
        policy
            .enforce_command("cat summary.txt", &cwd(), &home())
            .expect("'su' inside 'summary' is not a keyword hit");
    }

    #[test]
    fn rm_rf_root_is_rejected_but_workspace_target_is_not() {
        let policy = workspace(&["/tmp/ws"]);
        assert!(policy
            .enforce_command("rm -rf /", &cwd(), &home())
            .is_err());
        assert!(policy
            .enforce_command("rm -rf / --no-preserve-root", &cwd(), &home())
            .is_err());
        policy
            .enforce_command("rm -rf /tmp/ws/build", &cwd(), &home())
            .expect("recursive delete inside the workspace passes to path analysis");
    }

    #[test]
    fn substitutions_are_rejected_in_workspace_mode() {
        let policy = workspace(&["/tmp/ws"]);
        for bad in [
            "echo $(whoami)",
            "echo `whoami`",
            "echo ${HOME}",
            "diff <(ls) <(ls)",
            "tee >(wc -l)",
        ] {
            assert!(
                policy.enforce_command(bad, &cwd(), &home()).is_err(),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn out_of_root_paths_are_rejected_across_pipes_and_chains() {
        let policy = workspace(&["/tmp/ws"]);
        assert!(policy
            .enforce_command("cat /etc/hosts", &cwd(), &home())
            .is_err());
        assert!(policy
            .enforce_command("ls | grep x; cat /etc/passwd", &cwd(), &home())
            .is_err());
        assert!(policy
            .enforce_command("true && cat ../../etc/hosts", &cwd(), &home())
            .is_err());
        policy
            .enforce_command("cat notes.txt | sort && wc -l ./sub/file", &cwd(), &home())
            .expect("relative paths under the root are admissible");
    }

    #[test]
    fn env_assignment_values_are_analyzed() {
        let policy = workspace(&["/tmp/ws"]);
        assert!(policy
            .enforce_command("OUT=/var/log/x.log make", &cwd(), &home())
            .is_err());
        policy
            .enforce_command("OUT=/tmp/ws/x.log make", &cwd(), &home())
            .expect("assignment into the workspace is fine");
    }

    #[test]
    fn quoted_paths_are_unwrapped_once() {
        let policy = workspace(&["/tmp/ws"]);
        assert!(policy
            .enforce_command("cat \"/etc/hosts\"", &cwd(), &home())
            .is_err());
        policy
            .enforce_command("cat '/tmp/ws/a file.txt'", &cwd(), &home())
            .expect("quoted in-root path");
    }

    #[test]
    fn urls_are_not_treated_as_paths() {
        let policy = workspace(&["/tmp/ws"]);
        policy
            .enforce_command("curl https://example.com/a/b", &cwd(), &home())
            .expect("URL tokens are skipped");
    }

    #[test]
    fn tilde_paths_resolve_against_home() {
        let policy = workspace(&["/home/tester/project"]);
        policy
            .enforce_command("cat ~/project/readme.md", &cwd(), &home())
            .expect("inside home-rooted workspace");
        assert!(policy
            .enforce_command("cat ~/secrets.txt", &cwd(), &home())
            .is_err());
    }

    #[test]
    fn parent_traversal_cannot_escape_lexically() {
        let policy = workspace(&["/tmp/ws"]);
        assert!(policy
            .enforce_command("cat /tmp/ws/../other/file", &cwd(), &home())
            .is_err());
    }

    #[test]
    fn normalize_accepts_known_modes_and_dedups_roots() {
        let raw = PolicyConfig {
            mode: "workspace".into(),
            roots: vec![
                "/tmp/ws".into(),
                " /tmp/ws ".into(),
                "~/proj".into(),
                "".into(),
            ],
        };
        let policy = PermissionPolicy::normalize(&raw, true, &home()).expect("normalize");
        match policy {
            PermissionPolicy::Workspace { roots } => {
                assert_eq!(
                    roots,
                    vec![PathBuf::from("/tmp/ws"), PathBuf::from("/home/tester/proj")]
                );
            }
            other => panic!("expected workspace, got {other:?}"),
        }
    }

    #[test]
    fn normalize_full_drops_roots() {
        let raw = PolicyConfig {
            mode: "full".into(),
            roots: vec!["/tmp/ws".into()],
        };
        let policy = PermissionPolicy::normalize(&raw, true, &home()).expect("normalize");
        assert_eq!(policy, PermissionPolicy::Full);
        assert!(policy.to_config().roots.is_empty());
    }

    #[test]
    fn unknown_mode_is_lenient_workspace_or_strict_error() {
        let raw = PolicyConfig {
            mode: "yolo".into(),
            roots: vec!["/tmp/ws".into()],
        };
        let lenient = PermissionPolicy::normalize(&raw, false, &home()).expect("lenient");
        assert_eq!(lenient.mode(), "workspace");

        let err = PermissionPolicy::normalize(&raw, true, &home()).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidPolicy(_)));
    }

    #[test]
    fn resolve_cwd_prefers_requested_then_first_root() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("ws");
        std::fs::create_dir_all(root.join("sub")).expect("mkdir");
        let policy = PermissionPolicy::Workspace {
            roots: vec![root.clone()],
        };

        let picked = policy
            .resolve_cwd(Some(root.join("sub").to_str().unwrap()), &home())
            .expect("requested cwd in root");
        assert!(picked.ends_with("sub"));

        let fallback = policy.resolve_cwd(None, &home()).expect("first root");
        assert_eq!(fallback, std::fs::canonicalize(&root).unwrap());
    }

    #[test]
    fn resolve_cwd_missing_dir_is_validation_not_violation() {
        let policy = PermissionPolicy::Full;
        let err = policy
            .resolve_cwd(Some("/definitely/not/a/dir"), &home())
            .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidCwd(_)));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_cwd_rejects_symlink_escapes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("ws");
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&root).expect("mkdir root");
        std::fs::create_dir_all(&outside).expect("mkdir outside");
        let link = root.join("link");
        std::os::unix::fs::symlink(&outside, &link).expect("symlink");

        let policy = PermissionPolicy::Workspace { roots: vec![root] };
        let err = policy
            .resolve_cwd(Some(link.to_str().unwrap()), &home())
            .unwrap_err();
        assert!(err.is_violation(), "symlink must not escape the workspace");
    }
}
