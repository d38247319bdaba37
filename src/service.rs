//! Service records and the tables that index them.
//!
//! A service is an identity with policy and state, independent of whether
//! a process is currently running for it. The supervisor main loop drives
//! the state machine; this module owns the data and the pure transitions.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::clock::{Dur, Ts};
use crate::error::CmdError;
use crate::scan::is_valid_name;

/// Child exit code when exec plumbing or `execvp` itself fails.
pub const EXIT_INVALID_ENVIRONMENT: i32 = 127;

/// Backoff after a failed `fork` or control-channel allocation.
pub const FORK_RETRY_DELAY: Dur = Dur(2 << 32);

/// Floor and default for the restart interval.
pub const MIN_RESTART_INTERVAL: Dur = Dur(1 << 32);

pub const VAR_ARGS: &str = "args";
pub const VAR_FDS: &str = "fds";
pub const VAR_TAGS: &str = "tags";
pub const VAR_TRIGGERS: &str = "triggers";

pub const DEFAULT_FDS: &str = "null\tnull\tnull";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvcState {
    Down,
    Start,
    Up,
    Reaped,
}

impl SvcState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SvcState::Down => "down",
            SvcState::Start => "start",
            SvcState::Up => "up",
            SvcState::Reaped => "reaped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(Signal),
}

impl ExitStatus {
    pub fn render(&self) -> String {
        match self {
            ExitStatus::Exited(code) => format!("exit={code}"),
            ExitStatus::Signaled(sig) => format!("signal={}", sig.as_str()),
        }
    }
}

/// Packed `key=value\0` records in one contiguous buffer, so pool mode can
/// put a hard byte bound on each service's variables. Values may contain
/// tabs; the buffer ends with a NUL whenever it is nonempty.
#[derive(Debug, Default)]
pub struct VarBuf {
    buf: String,
    cap: Option<usize>,
}

impl VarBuf {
    pub fn new(cap: Option<usize>) -> VarBuf {
        VarBuf {
            buf: String::new(),
            cap,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.buf.split_terminator('\0').find_map(|rec| {
            rec.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), CmdError> {
        let mut next = String::with_capacity(self.buf.len() + key.len() + value.len() + 2);
        for rec in self.buf.split_terminator('\0') {
            if rec.split('=').next() != Some(key) {
                next.push_str(rec);
                next.push('\0');
            }
        }
        next.push_str(key);
        next.push('=');
        next.push_str(value);
        next.push('\0');
        if let Some(cap) = self.cap {
            if next.len() > cap {
                return Err(CmdError::limit(format!("vars exceed {cap} byte pool")));
            }
        }
        self.buf = next;
        Ok(())
    }

    pub fn remove(&mut self, key: &str) {
        let mut next = String::with_capacity(self.buf.len());
        for rec in self.buf.split_terminator('\0') {
            if rec.split('=').next() != Some(key) {
                next.push_str(rec);
                next.push('\0');
            }
        }
        self.buf = next;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[derive(Debug)]
pub struct Service {
    pub name: String,
    pub vars: VarBuf,
    pub state: SvcState,
    pub pid: Option<Pid>,
    pub wait_status: Option<ExitStatus>,
    pub start_time: Ts,
    pub reap_time: Ts,
    pub restart_interval: Dur,
    pub auto_restart: bool,
    /// Bitset by signal number; nonzero means the service is sigwoken.
    pub wake_signals: u64,
    /// Wake timer while in `Start`; unset means "start now".
    pub start_at: Ts,
    /// Membership flag for the active work queue.
    pub active: bool,
}

impl Service {
    fn new(name: String, var_cap: Option<usize>) -> Service {
        Service {
            name,
            vars: VarBuf::new(var_cap),
            state: SvcState::Down,
            pid: None,
            wait_status: None,
            start_time: Ts::UNSET,
            reap_time: Ts::UNSET,
            restart_interval: MIN_RESTART_INTERVAL,
            auto_restart: false,
            wake_signals: 0,
            start_at: Ts::UNSET,
            active: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }

    pub fn argv(&self) -> Vec<String> {
        match self.vars.get(VAR_ARGS) {
            Some(args) if !args.is_empty() => args.split('\t').map(String::from).collect(),
            _ => Vec::new(),
        }
    }

    pub fn fd_spec(&self) -> Vec<String> {
        let spec = self.vars.get(VAR_FDS).unwrap_or(DEFAULT_FDS);
        let spec = if spec.is_empty() { DEFAULT_FDS } else { spec };
        spec.split('\t').map(String::from).collect()
    }

    /// The moment another start attempt is allowed: immediately, unless
    /// the last run died inside the restart interval.
    pub fn restart_after(&self, now: Ts) -> Ts {
        if self.start_time.is_set() && self.reap_time - self.start_time < self.restart_interval {
            self.start_time + self.restart_interval
        } else {
            now
        }
    }

    /// `service.state` event for the current state.
    pub fn state_event(&self) -> String {
        match self.state {
            // reaped is transient; observers only ever see down
            SvcState::Down | SvcState::Reaped => {
                let mut line = format!("service.state\t{}\tdown\t{}", self.name, self.reap_time);
                if let Some(status) = &self.wait_status {
                    line.push('\t');
                    line.push_str(&status.render());
                }
                line
            }
            SvcState::Start => {
                format!("service.state\t{}\tstart\t{}", self.name, self.start_at)
            }
            SvcState::Up => format!(
                "service.state\t{}\tup\t{}\tpid={}",
                self.name,
                self.start_time,
                self.pid.map(Pid::as_raw).unwrap_or(0)
            ),
        }
    }
}

pub struct ServiceTable {
    services: BTreeMap<String, Service>,
    by_pid: BTreeMap<i32, String>,
    active: Vec<String>,
    count_cap: Option<usize>,
    var_cap: Option<usize>,
}

impl ServiceTable {
    pub fn new(count_cap: Option<usize>, var_cap: Option<usize>) -> ServiceTable {
        ServiceTable {
            services: BTreeMap::new(),
            by_pid: BTreeMap::new(),
            active: Vec::new(),
            count_cap,
            var_cap,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Service> {
        self.services.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.services.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    /// Looks a service up, creating the record on first reference. The
    /// bool is true when a fresh record was created (callers emit its
    /// initial `service.state` event).
    pub fn get_or_create(&mut self, name: &str) -> Result<(&mut Service, bool), CmdError> {
        if !is_valid_name(name) {
            return Err(CmdError::invalid(format!("bad service name {name}")));
        }
        if let Some(cap) = self.count_cap {
            if !self.services.contains_key(name) && self.services.len() >= cap {
                return Err(CmdError::limit("service table full"));
            }
        }
        let var_cap = self.var_cap;
        let mut created = false;
        let svc = self.services.entry(name.to_string()).or_insert_with(|| {
            created = true;
            Service::new(name.to_string(), var_cap)
        });
        Ok((svc, created))
    }

    /// `service.delete`, refused while a process exists for the name.
    pub fn delete(&mut self, name: &str) -> Result<(), CmdError> {
        match self.services.get(name) {
            None => Err(CmdError::not_found(format!("no service named {name}"))),
            Some(svc) if svc.is_running() => {
                Err(CmdError::state(format!("{name} is running")))
            }
            Some(_) => {
                self.services.remove(name);
                Ok(())
            }
        }
    }

    /// Binds a freshly forked pid to the service and the pid index.
    pub fn bind_pid(&mut self, name: &str, pid: Pid) {
        if let Some(svc) = self.services.get_mut(name) {
            svc.pid = Some(pid);
            self.by_pid.insert(pid.as_raw(), name.to_string());
        }
    }

    /// Drops pid-index membership; `pid ≠ 0 ⇔ in index` holds throughout.
    pub fn release_pid(&mut self, name: &str) {
        if let Some(svc) = self.services.get_mut(name) {
            if let Some(pid) = svc.pid.take() {
                self.by_pid.remove(&pid.as_raw());
            }
        }
    }

    pub fn name_of_pid(&self, pid: Pid) -> Option<&str> {
        self.by_pid.get(&pid.as_raw()).map(String::as_str)
    }

    pub fn mark_active(&mut self, name: &str) {
        if let Some(svc) = self.services.get_mut(name) {
            if !svc.active {
                svc.active = true;
                self.active.push(name.to_string());
            }
        }
    }

    /// True while the active queue holds work; the main loop must not
    /// sleep past it.
    pub fn has_active(&self) -> bool {
        !self.active.is_empty()
    }

    /// Drains the active queue, clearing membership flags. Services may
    /// re-mark themselves while being stepped.
    pub fn take_active(&mut self) -> Vec<String> {
        let names = std::mem::take(&mut self.active);
        for name in &names {
            if let Some(svc) = self.services.get_mut(name) {
                svc.active = false;
            }
        }
        names
    }

    /// Members of the sigwake walk: down services with a nonzero trigger
    /// set.
    pub fn sigwake_members(&self) -> Vec<String> {
        self.services
            .values()
            .filter(|s| s.wake_signals != 0 && s.state == SvcState::Down)
            .map(|s| s.name.clone())
            .collect()
    }

    /// Earliest armed wake timer across all starting services.
    pub fn next_wake(&self) -> Option<Ts> {
        self.services
            .values()
            .filter(|s| s.state == SvcState::Start && s.start_at.is_set())
            .map(|s| s.start_at)
            .min()
    }

    pub fn first_after(&self, last: Option<&str>) -> Option<&Service> {
        match last {
            None => self.services.values().next(),
            Some(last) => self
                .services
                .range::<str, _>((Excluded(last), Unbounded))
                .map(|(_, s)| s)
                .next(),
        }
    }
}

// === Tests === //
