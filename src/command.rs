//! The control protocol: a static command table and its handlers.
//!
//! Handlers parse their own argument tails, mutate the core through
//! typed calls, and answer with events. A bad command costs exactly one
//! `error` event; it never disconnects the controller and never touches
//! the supervisor's health.

use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::clock::Ts;
use crate::control::{ControllerSet, DumpPhase};
use crate::error::{Category, CmdError};
use crate::fdtab::FileFlags;
use crate::options::{apply_service_opt, render_service_opts};
use crate::scan::{fields, is_comment, is_valid_name, next_field};
use crate::service::{DEFAULT_FDS, VAR_ARGS, VAR_FDS};
use crate::signals::parse_signal;
use crate::supervisor::{request_start, signal_all, Core};
use crate::term::{DEFAULT_DRAIN_WAIT, DEFAULT_KILL_WAIT, DEFAULT_TERM_WAIT};

type Handler = fn(&mut Core, &mut ControllerSet, usize, &str, Ts) -> Result<(), CmdError>;

const COMMANDS: &[(&str, Handler)] = &[
    ("statedump", cmd_statedump),
    ("echo", cmd_echo),
    ("service.args", cmd_service_args),
    ("service.fds", cmd_service_fds),
    ("service.opts", cmd_service_opts),
    ("service.start", cmd_service_start),
    ("service.signal", cmd_service_signal),
    ("service.delete", cmd_service_delete),
    ("fd.pipe", cmd_fd_pipe),
    ("fd.open", cmd_fd_open),
    ("fd.dup", cmd_fd_dup),
    ("fd.delete", cmd_fd_delete),
    ("signal.clear", cmd_signal_clear),
    ("log.filter", cmd_log_filter),
    ("log.dest", cmd_log_dest),
    ("failsafe", cmd_failsafe),
    ("shutdown", cmd_shutdown),
    ("terminate", cmd_terminate),
    ("exec_on_exit", cmd_exec_on_exit),
];

/// Parses and runs one line from controller `id`.
pub fn dispatch(core: &mut Core, ctls: &mut ControllerSet, id: usize, line: &str, now: Ts) {
    if is_comment(line) {
        return;
    }
    let mut rest = line;
    let Some(cmd) = next_field(&mut rest) else {
        return;
    };
    match COMMANDS.iter().find(|(name, _)| *name == cmd) {
        None => ctls.send(id, &format!("error\tunknown-command\t{cmd}"), now),
        Some((_, handler)) => {
            if let Err(e) = handler(core, ctls, id, rest, now) {
                // internal means a bug, not a bad command
                if e.category == Category::Internal {
                    core.term.fail_internal(&e.detail);
                }
                ctls.send(id, &format!("error\t{e}"), now);
            }
        }
    }
}

fn want_field<'a>(rest: &mut &'a str, what: &str) -> Result<&'a str, CmdError> {
    match next_field(rest) {
        Some(f) if !f.is_empty() => Ok(f),
        _ => Err(CmdError::invalid(format!("missing {what}"))),
    }
}

/// First-reference service creation; a fresh record announces itself.
fn ensure_service(
    core: &mut Core,
    ctls: &mut ControllerSet,
    name: &str,
    now: Ts,
) -> Result<(), CmdError> {
    let (_, created) = core.services.get_or_create(name)?;
    if created {
        let line = core
            .services
            .get(name)
            .map(|svc| svc.state_event())
            .unwrap_or_default();
        ctls.broadcast(&line, now);
    }
    Ok(())
}

fn cmd_statedump(
    _core: &mut Core,
    ctls: &mut ControllerSet,
    id: usize,
    _rest: &str,
    _now: Ts,
) -> Result<(), CmdError> {
    if let Some(ep) = ctls.get_mut(id) {
        ep.dump = Some(DumpPhase::Fds(None));
    }
    Ok(())
}

fn cmd_echo(
    _core: &mut Core,
    ctls: &mut ControllerSet,
    id: usize,
    rest: &str,
    now: Ts,
) -> Result<(), CmdError> {
    let line = if rest.is_empty() {
        "echo".to_string()
    } else {
        format!("echo\t{rest}")
    };
    ctls.send(id, &line, now);
    Ok(())
}

fn cmd_service_args(
    core: &mut Core,
    ctls: &mut ControllerSet,
    id: usize,
    rest: &str,
    now: Ts,
) -> Result<(), CmdError> {
    let mut rest = rest;
    let name = want_field(&mut rest, "service name")?;
    ensure_service(core, ctls, name, now)?;
    if rest.is_empty() {
        // query form echoes the stored bytes exactly
        let svc = core
            .services
            .get(name)
            .ok_or_else(|| CmdError::not_found(format!("no service named {name}")))?;
        let line = match svc.vars.get(VAR_ARGS) {
            Some(args) if !args.is_empty() => format!("service.args\t{name}\t{args}"),
            _ => format!("service.args\t{name}"),
        };
        ctls.send(id, &line, now);
        return Ok(());
    }
    let svc = core
        .services
        .get_mut(name)
        .ok_or_else(|| CmdError::not_found(format!("no service named {name}")))?;
    svc.vars.set(VAR_ARGS, rest)?;
    ctls.broadcast(&format!("service.args\t{name}\t{rest}"), now);
    Ok(())
}

fn cmd_service_fds(
    core: &mut Core,
    ctls: &mut ControllerSet,
    _id: usize,
    rest: &str,
    now: Ts,
) -> Result<(), CmdError> {
    let mut rest = rest;
    let name = want_field(&mut rest, "service name")?;
    ensure_service(core, ctls, name, now)?;
    let spec = if rest.is_empty() { DEFAULT_FDS } else { rest };
    for token in fields(spec) {
        if token != "-" && !is_valid_name(token) {
            return Err(CmdError::invalid(format!("bad fd name {token}")));
        }
    }
    let svc = core
        .services
        .get_mut(name)
        .ok_or_else(|| CmdError::not_found(format!("no service named {name}")))?;
    svc.vars.set(VAR_FDS, spec)?;
    ctls.broadcast(&format!("service.fds\t{name}\t{spec}"), now);
    Ok(())
}

fn cmd_service_opts(
    core: &mut Core,
    ctls: &mut ControllerSet,
    id: usize,
    rest: &str,
    now: Ts,
) -> Result<(), CmdError> {
    let mut rest = rest;
    let name = want_field(&mut rest, "service name")?;
    ensure_service(core, ctls, name, now)?;
    if rest.is_empty() {
        let svc = core
            .services
            .get(name)
            .ok_or_else(|| CmdError::not_found(format!("no service named {name}")))?;
        let line = format!("service.opts\t{name}{}", render_service_opts(svc));
        ctls.send(id, &line, now);
        return Ok(());
    }
    // each token stands alone; one bad option never blocks the rest
    for token in fields(rest) {
        let svc = core
            .services
            .get_mut(name)
            .ok_or_else(|| CmdError::not_found(format!("no service named {name}")))?;
        if let Err(e) = apply_service_opt(svc, token) {
            ctls.send(id, &format!("error\t{e}"), now);
        }
    }
    let svc = core
        .services
        .get(name)
        .ok_or_else(|| CmdError::not_found(format!("no service named {name}")))?;
    ctls.broadcast(
        &format!("service.opts\t{name}{}", render_service_opts(svc)),
        now,
    );
    Ok(())
}

fn cmd_service_start(
    core: &mut Core,
    ctls: &mut ControllerSet,
    _id: usize,
    rest: &str,
    now: Ts,
) -> Result<(), CmdError> {
    let mut rest = rest;
    let name = want_field(&mut rest, "service name")?;
    let when = match next_field(&mut rest) {
        Some(delay) if !delay.is_empty() => {
            let delay = crate::options::parse_duration(delay)?;
            now + delay
        }
        _ => now,
    };
    request_start(core, ctls, name, when, now)
}

fn cmd_service_signal(
    core: &mut Core,
    _ctls: &mut ControllerSet,
    _id: usize,
    rest: &str,
    _now: Ts,
) -> Result<(), CmdError> {
    let mut rest = rest;
    let name = want_field(&mut rest, "service name")?;
    let sig = parse_signal(want_field(&mut rest, "signal name")?)?;
    let group = match next_field(&mut rest) {
        None => false,
        Some("group") => true,
        Some(other) => return Err(CmdError::invalid(format!("bad argument {other}"))),
    };
    let svc = core
        .services
        .get(name)
        .ok_or_else(|| CmdError::not_found(format!("no service named {name}")))?;
    let Some(pid) = svc.pid else {
        return Err(CmdError::state(format!("{name} not running")));
    };
    let target = if group {
        Pid::from_raw(-pid.as_raw())
    } else {
        pid
    };
    kill(target, sig)?;
    Ok(())
}

fn cmd_service_delete(
    core: &mut Core,
    ctls: &mut ControllerSet,
    _id: usize,
    rest: &str,
    now: Ts,
) -> Result<(), CmdError> {
    let mut rest = rest;
    let name = want_field(&mut rest, "service name")?;
    core.services.delete(name)?;
    ctls.broadcast(&format!("service.state\t{name}\tdeleted"), now);
    Ok(())
}

fn cmd_fd_pipe(
    core: &mut Core,
    ctls: &mut ControllerSet,
    _id: usize,
    rest: &str,
    now: Ts,
) -> Result<(), CmdError> {
    let mut rest = rest;
    let read_name = want_field(&mut rest, "read-end name")?;
    let write_name = want_field(&mut rest, "write-end name")?;
    let events = core.fds.pipe(read_name, write_name)?;
    for ev in events {
        ctls.broadcast(&ev, now);
    }
    Ok(())
}

fn cmd_fd_open(
    core: &mut Core,
    ctls: &mut ControllerSet,
    _id: usize,
    rest: &str,
    now: Ts,
) -> Result<(), CmdError> {
    let mut rest = rest;
    let name = want_field(&mut rest, "fd name")?;
    let flags = FileFlags::parse(want_field(&mut rest, "open flags")?)?;
    let path = want_field(&mut rest, "path")?;
    let event = core.fds.open(name, flags, path)?;
    ctls.broadcast(&event, now);
    Ok(())
}

fn cmd_fd_dup(
    core: &mut Core,
    ctls: &mut ControllerSet,
    _id: usize,
    rest: &str,
    now: Ts,
) -> Result<(), CmdError> {
    let mut rest = rest;
    let new_name = want_field(&mut rest, "new fd name")?;
    let old_name = want_field(&mut rest, "existing fd name")?;
    let event = core.fds.dup(new_name, old_name)?;
    ctls.broadcast(&event, now);
    Ok(())
}

fn cmd_fd_delete(
    core: &mut Core,
    ctls: &mut ControllerSet,
    _id: usize,
    rest: &str,
    now: Ts,
) -> Result<(), CmdError> {
    let mut rest = rest;
    let name = want_field(&mut rest, "fd name")?;
    let event = core.fds.delete(name)?;
    ctls.broadcast(&event, now);
    Ok(())
}

fn cmd_signal_clear(
    core: &mut Core,
    ctls: &mut ControllerSet,
    _id: usize,
    rest: &str,
    now: Ts,
) -> Result<(), CmdError> {
    let mut rest = rest;
    let sig = parse_signal(want_field(&mut rest, "signal name")?)?;
    let count: u32 = want_field(&mut rest, "count")?
        .parse()
        .map_err(|_| CmdError::invalid("bad count"))?;
    let ev = core
        .signals
        .buckets
        .clear(sig, count)
        .ok_or_else(|| CmdError::invalid(format!("{} is not trapped", sig.as_str())))?;
    ctls.broadcast(
        &format!("signal\t{}\t{}\t{}", ev.sig.as_str(), ev.count, ev.ts),
        now,
    );
    Ok(())
}

fn cmd_log_filter(
    core: &mut Core,
    ctls: &mut ControllerSet,
    id: usize,
    rest: &str,
    now: Ts,
) -> Result<(), CmdError> {
    let mut rest = rest;
    let more_verbose = match want_field(&mut rest, "+ or -")? {
        "+" => true,
        "-" => false,
        other => return Err(CmdError::invalid(format!("bad filter step {other}"))),
    };
    let level = core.log.adjust(more_verbose);
    ctls.send(id, &format!("log.filter\t{level}"), now);
    Ok(())
}

fn cmd_log_dest(
    core: &mut Core,
    ctls: &mut ControllerSet,
    id: usize,
    rest: &str,
    now: Ts,
) -> Result<(), CmdError> {
    let mut rest = rest;
    let name = want_field(&mut rest, "fd name")?;
    let fd = core
        .fds
        .get(name)
        .ok_or_else(|| CmdError::not_found(format!("no fd named {name}")))?
        .raw_fd();
    core.log.set_dest(Some(fd));
    ctls.send(id, &format!("log.dest\t{name}"), now);
    Ok(())
}

fn cmd_failsafe(
    core: &mut Core,
    _ctls: &mut ControllerSet,
    _id: usize,
    rest: &str,
    _now: Ts,
) -> Result<(), CmdError> {
    let mut rest = rest;
    let op = want_field(&mut rest, "+ or -")?;
    let code = want_field(&mut rest, "failsafe code")?;
    match op {
        "+" => {
            core.term.arm(code);
            Ok(())
        }
        "-" => core.term.disarm(code),
        other => Err(CmdError::invalid(format!("bad failsafe op {other}"))),
    }
}

fn cmd_shutdown(
    core: &mut Core,
    _ctls: &mut ControllerSet,
    _id: usize,
    rest: &str,
    now: Ts,
) -> Result<(), CmdError> {
    let mut rest = rest;
    let mut waits = [DEFAULT_TERM_WAIT, DEFAULT_KILL_WAIT, DEFAULT_DRAIN_WAIT];
    for slot in waits.iter_mut() {
        match next_field(&mut rest) {
            Some(t) if !t.is_empty() => *slot = crate::options::parse_duration(t)?,
            _ => break,
        }
    }
    core.term
        .request_shutdown(now, waits[0], waits[1], waits[2], None)?;
    tracing::info!("shutdown requested, signalling services");
    signal_all(core, nix::sys::signal::Signal::SIGTERM);
    Ok(())
}

fn cmd_terminate(
    core: &mut Core,
    _ctls: &mut ControllerSet,
    _id: usize,
    rest: &str,
    _now: Ts,
) -> Result<(), CmdError> {
    let mut rest = rest;
    let value = match next_field(&mut rest) {
        Some(v) if !v.is_empty() => v
            .parse::<i32>()
            .map_err(|_| CmdError::invalid("bad exit value"))?,
        _ => 0,
    };
    let code = next_field(&mut rest).filter(|c| !c.is_empty());
    core.term.request_terminate(value, code)
}

fn cmd_exec_on_exit(
    core: &mut Core,
    _ctls: &mut ControllerSet,
    _id: usize,
    rest: &str,
    _now: Ts,
) -> Result<(), CmdError> {
    let argv: Vec<String> = fields(rest).map(String::from).collect();
    if argv.is_empty() {
        return Err(CmdError::invalid("exec_on_exit needs an argv"));
    }
    core.term.exec_on_exit = argv;
    Ok(())
}

// === Tests === //
