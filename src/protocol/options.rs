//! # Spawn option parsing and validation.
//!
//! Every `run`/`shell`/`manage` command carries an option list. This module
//! turns the raw term into a validated [`SpawnOptions`] before anything is
//! forked, so a bad option can never leave a half-configured child behind.
//!
//! ## Accepted options
//! ```text
//! {cd, Dir} | {env, ["K=V" | {K, V}]} | {kill, Cmd} | {kill_timeout, Sec}
//! {user, Name} | {group, Gid | Name} | {nice, -20..20}
//! stdin  | {stdin,  null | close | File}
//! stdout | {stdout, Device}
//! stderr | {stderr, Device}
//! Device = pipe | null | close | stdout | stderr | File | {append, File}
//! ```
//! A bare stream atom is shorthand for `pipe`: the stream is kept by the
//! daemon (stdin queue, or stdout/stderr forwarding).
//!
//! ## Rules
//! - Every option may appear **at most once**
//! - Redirect targets that are atoms are devices; strings are file paths
//! - Self-references (`{stdout, stdout}`) and the stdout↔stderr cycle are
//!   rejected here, at parse time
//! - `{user, …}` is resolved (and privilege-checked) here, at parse time

use std::collections::HashSet;
use std::time::Duration;

use nix::unistd::{Group, User};

use crate::error::CommandError;
use crate::privilege::Privilege;
use crate::protocol::term::Term;

/// Where one of the child's standard streams is pointed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StdioDevice {
    /// No explicit redirection: stdin reads `/dev/null`, outputs inherit
    /// the daemon's own descriptors.
    #[default]
    Default,
    /// Piped to the daemon (stdin queue, or stdout/stderr forwarding).
    Pipe,
    /// Connected to `/dev/null`.
    Null,
    /// The descriptor is closed in the child.
    Close,
    /// stderr duplicated onto stdout.
    ToStdout,
    /// stdout duplicated onto stderr.
    ToStderr,
    /// Opened file (truncate or append).
    File { path: String, append: bool },
}

/// Validated spawn options for one child.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Child working directory.
    pub cd: Option<String>,
    /// Environment overrides, merged over the daemon's environment at spawn
    /// (caller-provided keys win).
    pub env: Vec<(String, String)>,
    /// Custom kill command run instead of the first SIGTERM.
    pub kill_cmd: Option<String>,
    /// Grace between the first stop attempt and SIGKILL.
    pub kill_timeout: Duration,
    /// Run-as user (name and resolved uid).
    pub user: Option<(String, u32)>,
    /// Run-with group id.
    pub group: Option<u32>,
    /// Niceness adjustment, `-20..=20`.
    pub nice: Option<i32>,
    /// stdin / stdout / stderr devices, in descriptor order.
    pub stdio: [StdioDevice; 3],
}

impl SpawnOptions {
    /// Options with all defaults; used for kill-command helpers.
    pub fn with_kill_timeout(kill_timeout: Duration) -> Self {
        Self {
            cd: None,
            env: Vec::new(),
            kill_cmd: None,
            kill_timeout,
            user: None,
            group: None,
            nice: None,
            stdio: Default::default(),
        }
    }

    /// Parses and validates an option list term.
    ///
    /// `default_kill_timeout` seeds `kill_timeout` when the option is
    /// absent. `privilege` gates `{user, …}` targets.
    pub fn parse(
        term: &Term,
        privilege: &Privilege,
        default_kill_timeout: Duration,
    ) -> Result<Self, CommandError> {
        let items = term
            .as_list()
            .ok_or_else(|| CommandError::BadOption("option list expected".into()))?;

        let mut opts = SpawnOptions::with_kill_timeout(default_kill_timeout);
        let mut seen: HashSet<&'static str> = HashSet::new();

        for item in items {
            let (name, value) = split_option(item)?;
            if !seen.insert(name) {
                return Err(CommandError::BadOption(format!(
                    "duplicate {name} option specified"
                )));
            }
            match name {
                "cd" => opts.cd = Some(text_value(name, value)?),
                "kill" => opts.kill_cmd = Some(text_value(name, value)?),
                "kill_timeout" => {
                    let secs = value.and_then(Term::as_int).filter(|s| *s >= 0);
                    match secs {
                        Some(secs) => opts.kill_timeout = Duration::from_secs(secs as u64),
                        None => {
                            return Err(CommandError::BadOption(
                                "invalid value of kill_timeout".into(),
                            ));
                        }
                    }
                }
                "nice" => match value.and_then(Term::as_int) {
                    Some(n @ -20..=20) => opts.nice = Some(n as i32),
                    _ => {
                        return Err(CommandError::BadOption(
                            "nice option must be an integer between -20 and 20".into(),
                        ));
                    }
                },
                "user" => {
                    let name = text_value("user", value)?;
                    let uid = resolve_user(&name)?;
                    privilege.check_spawn_user(&name, uid)?;
                    opts.user = Some((name, uid));
                }
                "group" => opts.group = Some(resolve_group(value)?),
                "env" => opts.env = parse_env(value)?,
                "stdin" => opts.stdio[0] = parse_device(0, value)?,
                "stdout" => opts.stdio[1] = parse_device(1, value)?,
                "stderr" => opts.stdio[2] = parse_device(2, value)?,
                other => {
                    return Err(CommandError::BadOption(format!("bad option: {other}")));
                }
            }
        }

        if opts.stdio[1] == StdioDevice::ToStderr && opts.stdio[2] == StdioDevice::ToStdout {
            return Err(CommandError::BadOption(
                "circular reference of stdout and stderr".into(),
            ));
        }

        Ok(opts)
    }
}

/// Splits one option into its canonical name and optional value term.
///
/// A bare atom is an option without a value; everything else must be a
/// `{Name, Value}` pair.
fn split_option(item: &Term) -> Result<(&'static str, Option<&Term>), CommandError> {
    match item {
        Term::Atom(name) => Ok((canonical_name(name)?, None)),
        Term::Tuple(pair) if pair.len() == 2 => {
            let name = pair[0]
                .as_atom()
                .ok_or_else(|| bad_shape())
                .and_then(canonical_name)?;
            Ok((name, Some(&pair[1])))
        }
        _ => Err(bad_shape()),
    }
}

fn bad_shape() -> CommandError {
    CommandError::BadOption("cmd option must be {Cmd, Opt} or atom".into())
}

fn canonical_name(name: &str) -> Result<&'static str, CommandError> {
    const NAMES: [&str; 10] = [
        "stdin",
        "stdout",
        "stderr",
        "cd",
        "env",
        "kill",
        "kill_timeout",
        "nice",
        "user",
        "group",
    ];
    NAMES
        .iter()
        .find(|known| **known == name)
        .copied()
        .ok_or_else(|| CommandError::BadOption(format!("bad option: {name}")))
}

/// Extracts a non-empty text value (charlist or binary).
fn text_value(name: &str, value: Option<&Term>) -> Result<String, CommandError> {
    value
        .and_then(Term::to_text)
        .filter(|text| !text.is_empty())
        .ok_or_else(|| CommandError::BadOption(format!("{name} bad option value")))
}

fn resolve_user(name: &str) -> Result<u32, CommandError> {
    match User::from_name(name) {
        Ok(Some(user)) => Ok(user.uid.as_raw()),
        _ => Err(CommandError::BadOption(format!("Invalid user {name}"))),
    }
}

fn resolve_group(value: Option<&Term>) -> Result<u32, CommandError> {
    if let Some(gid) = value.and_then(Term::as_int) {
        if gid >= 0 && gid <= i64::from(u32::MAX) {
            return Ok(gid as u32);
        }
        return Err(CommandError::BadOption(
            "group bad group value type (expected int or string)".into(),
        ));
    }
    let name = text_value("group", value)?;
    match Group::from_name(&name) {
        Ok(Some(group)) => Ok(group.gid.as_raw()),
        _ => Err(CommandError::BadOption(format!(
            "group invalid group name: {name}"
        ))),
    }
}

/// Parses `{env, [Entry]}` where Entry is `"K=V"` or `{K, V}`.
///
/// Both spellings produce identical results downstream.
fn parse_env(value: Option<&Term>) -> Result<Vec<(String, String)>, CommandError> {
    let items = value
        .and_then(Term::as_list)
        .ok_or_else(|| CommandError::BadOption("env list expected".into()))?;

    let mut entries = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let parsed = match item {
            Term::Tuple(pair) if pair.len() == 2 => pair[0]
                .to_text()
                .zip(pair[1].to_text())
                .filter(|(key, _)| !key.is_empty()),
            other => other.to_text().and_then(|entry| {
                let (key, value) = entry.split_once('=')?;
                if key.is_empty() {
                    return None;
                }
                Some((key.to_string(), value.to_string()))
            }),
        };
        match parsed {
            Some(entry) => entries.push(entry),
            None => {
                return Err(CommandError::BadOption(format!(
                    "invalid env argument #{index}"
                )));
            }
        }
    }
    Ok(entries)
}

/// Parses a stream device. `None` (bare atom) requests a pipe.
fn parse_device(stream: usize, value: Option<&Term>) -> Result<StdioDevice, CommandError> {
    const STREAMS: [&str; 3] = ["stdin", "stdout", "stderr"];
    let own_name = STREAMS[stream];

    let device = match value {
        None => StdioDevice::Pipe,
        Some(Term::Atom(name)) => match name.as_str() {
            "pipe" => StdioDevice::Pipe,
            "null" => StdioDevice::Null,
            "close" => StdioDevice::Close,
            "stdout" if stream == 2 => StdioDevice::ToStdout,
            "stderr" if stream == 1 => StdioDevice::ToStderr,
            other if other == own_name => {
                return Err(CommandError::BadOption(format!(
                    "self-reference of {own_name}"
                )));
            }
            _ => {
                return Err(CommandError::BadOption(format!(
                    "atom, string or {{append, Name}} tuple required for option {own_name}"
                )));
            }
        },
        Some(Term::Tuple(pair))
            if pair.len() == 2 && pair[0].as_atom() == Some("append") =>
        {
            StdioDevice::File {
                path: text_value(own_name, Some(&pair[1]))?,
                append: true,
            }
        }
        Some(other) => StdioDevice::File {
            path: text_value(own_name, Some(other))?,
            append: false,
        },
    };

    if stream == 0 {
        let ok = matches!(
            device,
            StdioDevice::Pipe
                | StdioDevice::Null
                | StdioDevice::Close
                | StdioDevice::File { append: false, .. }
        );
        if !ok {
            return Err(CommandError::BadOption(
                "invalid stdin redirection option".into(),
            ));
        }
    }
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::term::Term;

    fn opt(name: &str, value: Term) -> Term {
        Term::tuple(vec![Term::atom(name), value])
    }

    fn parse(items: Vec<Term>) -> Result<SpawnOptions, CommandError> {
        SpawnOptions::parse(
            &Term::List(items),
            &Privilege::unprivileged(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn defaults_are_null_stdin_and_inherited_outputs() {
        let opts = parse(vec![]).unwrap();
        assert_eq!(opts.stdio, [StdioDevice::Default, StdioDevice::Default, StdioDevice::Default]);
        assert_eq!(opts.kill_timeout, Duration::from_secs(5));
    }

    #[test]
    fn bare_stream_atom_means_pipe() {
        let opts = parse(vec![Term::atom("stdin"), Term::atom("stdout")]).unwrap();
        assert_eq!(opts.stdio[0], StdioDevice::Pipe);
        assert_eq!(opts.stdio[1], StdioDevice::Pipe);
        assert_eq!(opts.stdio[2], StdioDevice::Default);
    }

    #[test]
    fn duplicate_options_are_rejected() {
        let err = parse(vec![Term::atom("stdout"), opt("stdout", Term::atom("null"))])
            .unwrap_err();
        assert_eq!(
            err,
            CommandError::BadOption("duplicate stdout option specified".into())
        );
    }

    #[test]
    fn self_reference_is_rejected() {
        let err = parse(vec![opt("stdout", Term::atom("stdout"))]).unwrap_err();
        assert_eq!(
            err,
            CommandError::BadOption("self-reference of stdout".into())
        );
    }

    #[test]
    fn circular_reference_is_rejected() {
        let err = parse(vec![
            opt("stdout", Term::atom("stderr")),
            opt("stderr", Term::atom("stdout")),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            CommandError::BadOption("circular reference of stdout and stderr".into())
        );
    }

    #[test]
    fn one_sided_cross_redirect_is_fine() {
        let opts = parse(vec![opt("stderr", Term::atom("stdout"))]).unwrap();
        assert_eq!(opts.stdio[2], StdioDevice::ToStdout);
    }

    #[test]
    fn string_device_is_a_file_path() {
        let opts = parse(vec![opt("stdout", Term::string("/tmp/out.log"))]).unwrap();
        assert_eq!(
            opts.stdio[1],
            StdioDevice::File {
                path: "/tmp/out.log".into(),
                append: false
            }
        );
    }

    #[test]
    fn append_tuple_is_an_appending_file() {
        let device = opt(
            "stdout",
            Term::tuple(vec![Term::atom("append"), Term::string("/tmp/t")]),
        );
        let opts = parse(vec![device]).unwrap();
        assert_eq!(
            opts.stdio[1],
            StdioDevice::File {
                path: "/tmp/t".into(),
                append: true
            }
        );
    }

    #[test]
    fn stdin_refuses_append_and_cross_redirects() {
        let append = opt(
            "stdin",
            Term::tuple(vec![Term::atom("append"), Term::string("/tmp/t")]),
        );
        assert!(parse(vec![append]).is_err());
        assert!(parse(vec![opt("stdin", Term::atom("stdout"))]).is_err());
    }

    #[test]
    fn nice_is_range_checked() {
        assert!(parse(vec![opt("nice", Term::Int(-20))]).is_ok());
        assert!(parse(vec![opt("nice", Term::Int(21))]).is_err());
        assert!(parse(vec![opt("nice", Term::Int(-21))]).is_err());
    }

    #[test]
    fn kill_timeout_overrides_default() {
        let opts = parse(vec![opt("kill_timeout", Term::Int(3))]).unwrap();
        assert_eq!(opts.kill_timeout, Duration::from_secs(3));
        assert!(parse(vec![opt("kill_timeout", Term::Int(-1))]).is_err());
    }

    #[test]
    fn env_accepts_both_entry_forms() {
        let entries = Term::List(vec![
            Term::string("A=1"),
            Term::tuple(vec![Term::string("B"), Term::string("2")]),
        ]);
        let opts = parse(vec![opt("env", entries)]).unwrap();
        assert_eq!(
            opts.env,
            vec![("A".into(), "1".into()), ("B".into(), "2".into())]
        );
    }

    #[test]
    fn env_rejects_entries_without_separator() {
        let entries = Term::List(vec![Term::string("NOEQUALS")]);
        let err = parse(vec![opt("env", entries)]).unwrap_err();
        assert_eq!(
            err,
            CommandError::BadOption("invalid env argument #0".into())
        );
    }

    #[test]
    fn root_spawn_is_refused_when_privileged() {
        let privilege = Privilege::new(true, Vec::new());
        let term = Term::List(vec![opt("user", Term::string("root"))]);
        let err =
            SpawnOptions::parse(&term, &privilege, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, CommandError::Privilege(_)));
    }

    #[test]
    fn allow_list_gates_spawn_users() {
        let privilege = Privilege::new(true, vec!["nobody".into()]);
        // root is refused outright; any user outside the list is refused too.
        let term = Term::List(vec![opt("user", Term::string("root"))]);
        assert!(SpawnOptions::parse(&term, &privilege, Duration::from_secs(5)).is_err());
    }

    #[test]
    fn unknown_option_is_reported_by_name() {
        let err = parse(vec![opt("bogus", Term::Int(1))]).unwrap_err();
        assert_eq!(err, CommandError::BadOption("bad option: bogus".into()));
    }
}
