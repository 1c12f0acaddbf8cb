//! # Host command decoding and reply encoding.
//!
//! Every inbound frame is `{TransId, Body}`. The envelope must be sound —
//! a frame whose outer shape cannot be read leaves the stream position
//! meaningless, so it is fatal. Everything inside the body decodes into
//! `Result<Command, CommandError>`: a bad command costs one `{error, …}`
//! reply, never the daemon.
//!
//! ## Command vocabulary
//! ```text
//! {manage, OsPid, Options}     adopt an existing process
//! {run | shell, Cmd, Options}  spawn $SHELL -c Cmd
//! {stop, OsPid}                graceful termination
//! {kill, OsPid, Signal}        arbitrary signal
//! {list}                       enumerate managed pids
//! {stdin, OsPid, Data}         queue stdin bytes (no reply)
//! {shutdown}                   clean daemon exit
//! ```
//!
//! Replies carry the request's TransId; daemon-originated messages
//! (`exit_status`, `stdout`, `stderr`) carry TransId `0`.

use std::time::Duration;

use crate::error::{CommandError, DaemonError, Reason};
use crate::events::OutStream;
use crate::privilege::Privilege;
use crate::protocol::options::SpawnOptions;
use crate::protocol::term::{self, Term};

/// One decoded host command.
#[derive(Debug, Clone)]
pub enum Command {
    /// Adopt an externally started process.
    Manage {
        /// Existing OS pid.
        pid: i32,
        /// Options; only `kill` and `kill_timeout` apply to adopted pids.
        opts: SpawnOptions,
    },
    /// Spawn `$SHELL -c cmd` (the `run` and `shell` tags are synonyms).
    Run {
        /// Shell command text.
        cmd: String,
        /// Validated spawn options.
        opts: SpawnOptions,
    },
    /// Begin graceful termination of a child.
    Stop {
        /// Target pid.
        pid: i32,
    },
    /// Send an arbitrary signal to a pid.
    Kill {
        /// Target pid.
        pid: i32,
        /// Signal number.
        signal: i32,
    },
    /// Enumerate managed pids.
    List,
    /// Queue bytes for a child's stdin. Never acknowledged.
    Stdin {
        /// Target pid.
        pid: i32,
        /// Payload bytes.
        data: Vec<u8>,
    },
    /// Clean daemon shutdown.
    Shutdown,
}

/// A decoded request: the transaction id plus the command or its error.
#[derive(Debug)]
pub struct Request {
    /// Host transaction id (non-zero for host-originated frames).
    pub trans_id: i64,
    /// The command, or the per-command error to reply with.
    pub body: Result<Command, CommandError>,
}

/// Decodes a request frame.
///
/// Envelope damage (unreadable term, wrong outer shape) is a
/// [`DaemonError::FrameDecode`]; anything inside the body stays a
/// per-command error carried in [`Request::body`].
pub fn decode_request(
    payload: &[u8],
    privilege: &Privilege,
    default_kill_timeout: Duration,
) -> Result<Request, DaemonError> {
    let envelope = term::decode(payload).map_err(|_| DaemonError::FrameDecode)?;
    let pair = envelope.as_tuple().ok_or(DaemonError::FrameDecode)?;
    if pair.len() != 2 {
        return Err(DaemonError::FrameDecode);
    }
    let trans_id = pair[0].as_int().ok_or(DaemonError::FrameDecode)?;
    let body = pair[1].as_tuple().ok_or(DaemonError::FrameDecode)?;
    if body.is_empty() {
        return Err(DaemonError::FrameDecode);
    }

    Ok(Request {
        trans_id,
        body: decode_body(body, privilege, default_kill_timeout),
    })
}

fn decode_body(
    body: &[Term],
    privilege: &Privilege,
    default_kill_timeout: Duration,
) -> Result<Command, CommandError> {
    let name = body[0].as_atom().unwrap_or_default();
    match name {
        "manage" => {
            if body.len() != 3 {
                return Err(CommandError::BadArg);
            }
            let pid = pid_arg(&body[1]).ok_or(CommandError::BadArg)?;
            let opts = SpawnOptions::parse(&body[2], privilege, default_kill_timeout)
                .map_err(|_| CommandError::BadArg)?;
            Ok(Command::Manage { pid, opts })
        }
        "run" | "shell" => {
            if body.len() != 3 {
                return Err(CommandError::BadArg);
            }
            let cmd = body[1].to_text().filter(|c| !c.is_empty()).ok_or_else(|| {
                CommandError::BadOption(
                    "badarg: cmd string expected or string size too large".into(),
                )
            })?;
            let opts = SpawnOptions::parse(&body[2], privilege, default_kill_timeout)?;
            Ok(Command::Run { cmd, opts })
        }
        "stop" => {
            if body.len() != 2 {
                return Err(CommandError::BadArg);
            }
            let pid = pid_arg(&body[1]).ok_or(CommandError::BadArg)?;
            Ok(Command::Stop { pid })
        }
        "kill" => {
            if body.len() != 3 {
                return Err(CommandError::BadArg);
            }
            let pid = pid_arg(&body[1]).ok_or(CommandError::BadArg)?;
            let signal = body[2].as_int().ok_or(CommandError::BadArg)?;
            let signal = i32::try_from(signal).map_err(|_| CommandError::BadArg)?;
            Ok(Command::Kill { pid, signal })
        }
        "list" => {
            if body.len() != 1 {
                return Err(CommandError::BadArg);
            }
            Ok(Command::List)
        }
        "stdin" => {
            if body.len() != 3 {
                return Err(CommandError::BadArg);
            }
            let pid = pid_arg(&body[1]).ok_or(CommandError::BadArg)?;
            let data = body[2].to_bytes().ok_or(CommandError::BadArg)?;
            Ok(Command::Stdin { pid, data })
        }
        "shutdown" => Ok(Command::Shutdown),
        other => Err(CommandError::UnknownCommand(other.to_string())),
    }
}

/// Pids on the wire are positive integers that fit an OS pid.
fn pid_arg(term: &Term) -> Option<i32> {
    term.as_int()
        .and_then(|pid| i32::try_from(pid).ok())
        .filter(|pid| *pid > 0)
}

// ---- Reply encoding ----

/// `{TransId, ok}`
pub fn ok_reply(trans_id: i64) -> Vec<u8> {
    term::encode(&Term::tuple(vec![Term::Int(trans_id), Term::atom("ok")]))
}

/// `{TransId, {ok, OsPid}}`
pub fn ok_pid_reply(trans_id: i64, pid: i32) -> Vec<u8> {
    term::encode(&Term::tuple(vec![
        Term::Int(trans_id),
        Term::tuple(vec![Term::atom("ok"), Term::Int(i64::from(pid))]),
    ]))
}

/// `{TransId, {ok, [OsPid]}}`
pub fn pid_list_reply(trans_id: i64, pids: &[i32]) -> Vec<u8> {
    term::encode(&Term::tuple(vec![
        Term::Int(trans_id),
        Term::tuple(vec![
            Term::atom("ok"),
            Term::List(pids.iter().map(|pid| Term::Int(i64::from(*pid))).collect()),
        ]),
    ]))
}

/// `{TransId, {error, Reason}}` with the atom/string split the host expects.
pub fn error_reply(trans_id: i64, err: &CommandError) -> Vec<u8> {
    let reason = match err.reason() {
        Reason::Atom(name) => Term::Atom(name),
        Reason::Text(text) => Term::string(text),
    };
    term::encode(&Term::tuple(vec![
        Term::Int(trans_id),
        Term::tuple(vec![Term::atom("error"), reason]),
    ]))
}

/// `{0, {exit_status, OsPid, Status}}`
pub fn exit_status_message(pid: i32, status: i32) -> Vec<u8> {
    term::encode(&Term::tuple(vec![
        Term::Int(0),
        Term::tuple(vec![
            Term::atom("exit_status"),
            Term::Int(i64::from(pid)),
            Term::Int(i64::from(status)),
        ]),
    ]))
}

/// `{0, {stdout | stderr, OsPid, Data}}`
pub fn output_message(stream: OutStream, pid: i32, data: &[u8]) -> Vec<u8> {
    term::encode(&Term::tuple(vec![
        Term::Int(0),
        Term::tuple(vec![
            Term::atom(stream.as_atom()),
            Term::Int(i64::from(pid)),
            Term::Binary(data.to_vec()),
        ]),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::term::Term;

    fn request(trans_id: i64, body: Term) -> Vec<u8> {
        term::encode(&Term::tuple(vec![Term::Int(trans_id), body]))
    }

    fn decode(payload: &[u8]) -> Request {
        decode_request(payload, &Privilege::unprivileged(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn run_command_decodes() {
        let frame = request(
            7,
            Term::tuple(vec![
                Term::atom("run"),
                Term::string("echo hi"),
                Term::List(vec![Term::atom("stdout")]),
            ]),
        );
        let req = decode(&frame);
        assert_eq!(req.trans_id, 7);
        match req.body.unwrap() {
            Command::Run { cmd, .. } => assert_eq!(cmd, "echo hi"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn shell_is_a_synonym_for_run() {
        let frame = request(
            1,
            Term::tuple(vec![
                Term::atom("shell"),
                Term::string("true"),
                Term::List(vec![]),
            ]),
        );
        assert!(matches!(decode(&frame).body, Ok(Command::Run { .. })));
    }

    #[test]
    fn unknown_command_is_a_reply_not_a_crash() {
        let frame = request(3, Term::tuple(vec![Term::atom("reboot")]));
        let req = decode(&frame);
        assert_eq!(
            req.body.unwrap_err(),
            CommandError::UnknownCommand("reboot".into())
        );
    }

    #[test]
    fn bad_arity_is_badarg() {
        let frame = request(4, Term::tuple(vec![Term::atom("stop")]));
        assert_eq!(decode(&frame).body.unwrap_err(), CommandError::BadArg);
    }

    #[test]
    fn negative_or_zero_pids_are_badarg() {
        for pid in [0i64, -1] {
            let frame = request(5, Term::tuple(vec![Term::atom("stop"), Term::Int(pid)]));
            assert_eq!(decode(&frame).body.unwrap_err(), CommandError::BadArg);
        }
    }

    #[test]
    fn stdin_accepts_binary_payloads() {
        let frame = request(
            6,
            Term::tuple(vec![
                Term::atom("stdin"),
                Term::Int(41),
                Term::Binary(b"hello\n".to_vec()),
            ]),
        );
        match decode(&frame).body.unwrap() {
            Command::Stdin { pid, data } => {
                assert_eq!(pid, 41);
                assert_eq!(data, b"hello\n");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn broken_envelope_is_fatal() {
        // Not a tuple at all.
        let payload = term::encode(&Term::atom("nonsense"));
        let err = decode_request(&payload, &Privilege::unprivileged(), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, DaemonError::FrameDecode));
    }

    #[test]
    fn manage_option_errors_collapse_to_badarg() {
        let frame = request(
            8,
            Term::tuple(vec![
                Term::atom("manage"),
                Term::Int(1234),
                Term::List(vec![Term::atom("bogus")]),
            ]),
        );
        assert_eq!(decode(&frame).body.unwrap_err(), CommandError::BadArg);
    }

    #[test]
    fn run_option_errors_keep_their_message() {
        let frame = request(
            9,
            Term::tuple(vec![
                Term::atom("run"),
                Term::string("true"),
                Term::List(vec![Term::atom("stdout"), Term::atom("stdout")]),
            ]),
        );
        assert_eq!(
            decode(&frame).body.unwrap_err(),
            CommandError::BadOption("duplicate stdout option specified".into())
        );
    }

    #[test]
    fn error_reply_uses_atoms_for_badarg() {
        let encoded = error_reply(2, &CommandError::BadArg);
        let term = term::decode(&encoded).unwrap();
        let pair = term.as_tuple().unwrap();
        assert_eq!(pair[0], Term::Int(2));
        let inner = pair[1].as_tuple().unwrap();
        assert_eq!(inner[0], Term::atom("error"));
        assert_eq!(inner[1], Term::atom("badarg"));
    }
}
