//! Typed option parsing: service options, booleans, durations and the
//! pool specs the CLI takes.

use std::str::FromStr;

use crate::clock::Dur;
use crate::error::CmdError;
use crate::service::{Service, MIN_RESTART_INTERVAL, VAR_TAGS, VAR_TRIGGERS};
use crate::signals::parse_signal;

/// The complete set of per-service options, which is also the set a
/// `KEY@` token may reset.
pub const SERVICE_OPTS: &[&str] = &["respawn", "respawn-delay", "triggers", "tags"];

/// `N:BYTES` preallocation spec for `--service-pool` and friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSpec {
    pub count: usize,
    pub bytes: usize,
}

impl FromStr for PoolSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<PoolSpec, String> {
        let (count, bytes) = s
            .split_once(':')
            .ok_or_else(|| format!("pool spec {s} is not N:BYTES"))?;
        Ok(PoolSpec {
            count: count
                .parse()
                .map_err(|_| format!("bad pool entry count {count}"))?,
            bytes: bytes
                .parse()
                .map_err(|_| format!("bad pool byte size {bytes}"))?,
        })
    }
}

pub fn parse_bool(s: &str) -> Result<bool, CmdError> {
    match s {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(CmdError::invalid(format!("bad boolean {other}"))),
    }
}

pub fn parse_duration(s: &str) -> Result<Dur, CmdError> {
    Dur::parse(s).ok_or_else(|| CmdError::invalid(format!("bad duration {s}")))
}

/// Parses a trigger list: comma-separated `always` and/or signal names.
/// Returns (auto-restart, wake bitset by signal number).
pub fn parse_triggers(list: &str) -> Result<(bool, u64), CmdError> {
    let mut always = false;
    let mut mask = 0u64;
    for word in list.split(',').filter(|w| !w.is_empty()) {
        if word == "always" {
            always = true;
        } else {
            let sig = parse_signal(word)?;
            mask |= 1 << sig as u32;
        }
    }
    Ok((always, mask))
}

/// Applies one `service.opts` token: `respawn`, `k=v`, or `KEY@` reset.
pub fn apply_service_opt(svc: &mut Service, token: &str) -> Result<(), CmdError> {
    if let Some(key) = token.strip_suffix('@') {
        return reset_service_opt(svc, key);
    }
    match token.split_once('=') {
        None => match token {
            "respawn" => {
                svc.auto_restart = true;
                Ok(())
            }
            other => Err(CmdError::invalid(format!("unknown option {other}"))),
        },
        Some(("respawn-delay", value)) => {
            let delay = parse_duration(value)?;
            if delay < MIN_RESTART_INTERVAL {
                return Err(CmdError::invalid("respawn-delay below 1 second"));
            }
            svc.restart_interval = delay;
            Ok(())
        }
        Some(("triggers", value)) | Some(("sig_wake", value)) => {
            let (always, mask) = parse_triggers(value)?;
            svc.vars.set(VAR_TRIGGERS, value)?;
            svc.auto_restart = always;
            svc.wake_signals = mask;
            Ok(())
        }
        Some(("tags", value)) => svc.vars.set(VAR_TAGS, value),
        Some((key, _)) => Err(CmdError::invalid(format!("unknown option {key}"))),
    }
}

fn reset_service_opt(svc: &mut Service, key: &str) -> Result<(), CmdError> {
    match key {
        "respawn" => svc.auto_restart = false,
        "respawn-delay" => svc.restart_interval = MIN_RESTART_INTERVAL,
        "triggers" => {
            svc.vars.remove(VAR_TRIGGERS);
            svc.auto_restart = false;
            svc.wake_signals = 0;
        }
        "tags" => svc.vars.remove(VAR_TAGS),
        other => return Err(CmdError::invalid(format!("unknown option {other}"))),
    }
    Ok(())
}

/// Current options as `service.opts` fields.
pub fn render_service_opts(svc: &Service) -> String {
    let mut out = String::new();
    if svc.auto_restart {
        out.push_str("\trespawn");
    }
    out.push_str(&format!("\trespawn-delay={}", svc.restart_interval));
    if let Some(triggers) = svc.vars.get(VAR_TRIGGERS) {
        out.push_str(&format!("\ttriggers={triggers}"));
    }
    if let Some(tags) = svc.vars.get(VAR_TAGS) {
        out.push_str(&format!("\ttags={tags}"));
    }
    out
}

// === Tests === //

#[cfg(test)]
mod test {
    use super::*;
    use crate::service::ServiceTable;
    use nix::sys::signal::Signal;

    fn service() -> (ServiceTable, String) {
        let mut t = ServiceTable::new(None, None);
        t.get_or_create("x").unwrap();
        (t, "x".to_string())
    }

    #[test]
    fn pool_spec_parsing() {
        assert_eq!(
            "8:256".parse::<PoolSpec>().unwrap(),
            PoolSpec {
                count: 8,
                bytes: 256
            }
        );
        assert!("8".parse::<PoolSpec>().is_err());
        assert!("a:b".parse::<PoolSpec>().is_err());
    }

    #[test]
    fn respawn_and_delay() {
        let (mut t, name) = service();
        let svc = t.get_mut(&name).unwrap();
        apply_service_opt(svc, "respawn").unwrap();
        assert!(svc.auto_restart);
        apply_service_opt(svc, "respawn-delay=2.5").unwrap();
        assert_eq!(svc.restart_interval, Dur::parse("2.5").unwrap());
        // the 1-second clamp
        assert!(apply_service_opt(svc, "respawn-delay=0.5").is_err());
        apply_service_opt(svc, "respawn@").unwrap();
        assert!(!svc.auto_restart);
    }

    #[test]
    fn triggers_set_and_reset() {
        let (mut t, name) = service();
        let svc = t.get_mut(&name).unwrap();
        apply_service_opt(svc, "triggers=always,SIGUSR1").unwrap();
        assert!(svc.auto_restart);
        assert_ne!(svc.wake_signals & (1 << Signal::SIGUSR1 as u32), 0);

        // replacement, not accumulation
        apply_service_opt(svc, "triggers=SIGHUP").unwrap();
        assert!(!svc.auto_restart);
        assert_eq!(svc.wake_signals, 1 << Signal::SIGHUP as u32);

        apply_service_opt(svc, "triggers@").unwrap();
        assert_eq!(svc.wake_signals, 0);
    }

    #[test]
    fn sig_wake_is_an_alias() {
        let (mut t, name) = service();
        let svc = t.get_mut(&name).unwrap();
        apply_service_opt(svc, "sig_wake=USR2").unwrap();
        assert_eq!(svc.wake_signals, 1 << Signal::SIGUSR2 as u32);
    }

    #[test]
    fn unknown_options_are_rejected() {
        let (mut t, name) = service();
        let svc = t.get_mut(&name).unwrap();
        assert!(apply_service_opt(svc, "nonsense").is_err());
        assert!(apply_service_opt(svc, "nonsense=1").is_err());
        assert!(apply_service_opt(svc, "nonsense@").is_err());
    }

    #[test]
    fn render_round_trip() {
        let (mut t, name) = service();
        let svc = t.get_mut(&name).unwrap();
        apply_service_opt(svc, "respawn").unwrap();
        apply_service_opt(svc, "triggers=SIGHUP").unwrap();
        apply_service_opt(svc, "tags=db,primary").unwrap();
        // triggers replaced auto_restart; re-arm it
        apply_service_opt(svc, "respawn").unwrap();
        assert_eq!(
            render_service_opts(svc),
            "\trespawn\trespawn-delay=1\ttriggers=SIGHUP\ttags=db,primary"
        );
    }
}
