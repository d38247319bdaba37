//! The owning supervisor record and its poll-driven main loop.
//!
//! Everything lives here: the service and fd tables, the signal queue,
//! the controllers, and termination state, passed around as one `Core`
//! instead of globals. One loop iteration reaps children, drains
//! signals, steps active services, services controller streams, and
//! then sleeps in `poll` until the next descriptor or timer fires. That
//! `poll` is the only place the process ever waits.

use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::execvp;
use nix::unistd::{fork, ForkResult};

use crate::clock::{Dur, Ts};
use crate::command;
use crate::control::{ControllerSet, DumpPhase, Endpoint};
use crate::error::{Category, CmdError};
use crate::fdtab::{FdTable, CONTROL_CMD, CONTROL_EVENT, CONTROL_SOCKET};
use crate::logging::LogControl;
use crate::options::render_service_opts;
use crate::service::{
    ExitStatus, ServiceTable, SvcState, EXIT_INVALID_ENVIRONMENT, FORK_RETRY_DELAY, VAR_ARGS,
    VAR_FDS,
};
use crate::signals::{self, SignalQueue};
use crate::term::{TermAction, Terminator};

/// How long an unresponsive service-owned controller may sit saturated
/// before its pipes are closed out from under it.
const WATCHDOG_DELAY: Dur = Dur(10 << 32);

/// Every table the protocol can touch, owned in one place.
pub struct Core {
    pub services: ServiceTable,
    pub fds: FdTable,
    pub signals: SignalQueue,
    pub term: Terminator,
    pub log: LogControl,
}

pub struct Supervisor {
    pub core: Core,
    pub ctls: ControllerSet,
    listener: Option<UnixListener>,
}

/// `service.start`, and the internal starts (sigwake, auto-restart).
/// Legal only from DOWN or START.
pub fn request_start(
    core: &mut Core,
    ctls: &mut ControllerSet,
    name: &str,
    when: Ts,
    now: Ts,
) -> Result<(), CmdError> {
    let svc = core
        .services
        .get_mut(name)
        .ok_or_else(|| CmdError::not_found(format!("no service named {name}")))?;
    match svc.state {
        SvcState::Down | SvcState::Start => {}
        _ => return Err(CmdError::state(format!("{name} already up"))),
    }
    svc.state = SvcState::Start;
    svc.start_at = if when > now { when } else { Ts::UNSET };
    let line = svc.state_event();
    ctls.broadcast(&line, now);
    core.services.mark_active(name);
    Ok(())
}

/// Sends `sig` to every service with a live process.
pub fn signal_all(core: &Core, sig: Signal) {
    for svc in core.services.iter() {
        if let Some(pid) = svc.pid {
            let _ = kill(pid, sig);
        }
    }
}

/// Per-slot launch plan derived from the service's fd list.
enum Slot {
    Close,
    Inherit(RawFd),
    Control,
}

/// Runs in the forked child: plumb the slots, reset signals, exec.
/// Nothing here allocates; everything is async-signal-safe until exec.
fn exec_child(argv: &[CString], slots: &mut [RawFd]) -> ! {
    signals::reset_for_child();

    let base = slots.len() as libc::c_int;
    // lift sources that sit inside the target range out of the way first
    for i in 0..slots.len() {
        let fd = slots[i];
        if fd >= 0 && (fd as usize) < slots.len() {
            let lifted = unsafe { libc::fcntl(fd, libc::F_DUPFD, base) };
            if lifted < 0 {
                unsafe { libc::_exit(EXIT_INVALID_ENVIRONMENT) };
            }
            slots[i] = lifted;
        }
    }
    for (i, fd) in slots.iter().enumerate() {
        if *fd >= 0 {
            if unsafe { libc::dup2(*fd, i as libc::c_int) } < 0 {
                unsafe { libc::_exit(EXIT_INVALID_ENVIRONMENT) };
            }
        } else {
            unsafe { libc::close(i as libc::c_int) };
        }
    }
    for fd in base..libc::FD_SETSIZE as libc::c_int {
        unsafe { libc::close(fd) };
    }

    let _ = execvp(&argv[0], argv);
    unsafe { libc::_exit(EXIT_INVALID_ENVIRONMENT) }
}

/// Fork/exec one service. On error nothing is left half-built: any
/// control endpoint is removed again and the caller backs off.
fn spawn_service(
    core: &mut Core,
    ctls: &mut ControllerSet,
    name: &str,
    now: Ts,
) -> Result<(), CmdError> {
    let (argv, spec) = {
        let svc = core
            .services
            .get(name)
            .ok_or_else(|| CmdError::not_found(format!("no service named {name}")))?;
        (svc.argv(), svc.fd_spec())
    };
    if argv.is_empty() {
        return Err(CmdError::invalid(format!("{name} has no args")));
    }
    let cargv: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<_, _>>()
        .map_err(|_| CmdError::invalid("NUL byte in args"))?;

    core.fds.heal_specials();

    // resolve every named slot before touching anything irreversible
    let mut plan: Vec<Slot> = Vec::with_capacity(spec.len());
    for token in &spec {
        plan.push(match token.as_str() {
            "-" => Slot::Close,
            CONTROL_SOCKET | CONTROL_CMD | CONTROL_EVENT => Slot::Control,
            other => Slot::Inherit(
                core.fds
                    .get(other)
                    .ok_or_else(|| CmdError::not_found(format!("no fd named {other}")))?
                    .raw_fd(),
            ),
        });
    }

    // a control name in the fd list makes the child a controller: the
    // parent keeps one end of a socketpair as a fresh endpoint
    let uses_cmd = spec
        .iter()
        .any(|t| t == CONTROL_CMD || t == CONTROL_SOCKET);
    let uses_event = spec
        .iter()
        .any(|t| t == CONTROL_EVENT || t == CONTROL_SOCKET);
    let mut control_child: Option<OwnedFd> = None;
    let mut ctl_id: Option<usize> = None;
    if uses_cmd || uses_event {
        let (parent, child) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;
        // silence unused directions so a one-way child cannot block on a
        // peer that will never speak
        let parent = UnixStream::from(parent);
        if !uses_cmd {
            let _ = parent.shutdown(std::net::Shutdown::Read);
        }
        if !uses_event {
            let _ = parent.shutdown(std::net::Shutdown::Write);
        }
        let in_fd = if uses_cmd {
            Some(parent.as_fd().try_clone_to_owned()?)
        } else {
            None
        };
        let out_fd = if uses_event {
            Some(parent.as_fd().try_clone_to_owned()?)
        } else {
            None
        };
        let mut ep = Endpoint::new(in_fd, out_fd)?;
        ep.owner = Some(name.to_string());
        ctl_id = Some(ctls.add(ep)?);
        control_child = Some(child);
    }

    let mut slots: Vec<RawFd> = plan
        .iter()
        .map(|slot| match slot {
            Slot::Close => -1,
            Slot::Inherit(fd) => *fd,
            Slot::Control => control_child
                .as_ref()
                .map(|fd| fd.as_raw_fd())
                .unwrap_or(-1),
        })
        .collect();

    match unsafe { fork() } {
        Ok(ForkResult::Child) => exec_child(&cargv, &mut slots),
        Ok(ForkResult::Parent { child }) => {
            drop(control_child);
            core.services.bind_pid(name, child);
            let svc = core
                .services
                .get_mut(name)
                .ok_or_else(|| CmdError::new(Category::Internal, "service vanished mid-spawn"))?;
            svc.state = SvcState::Up;
            svc.start_time = now;
            svc.wait_status = None;
            let line = svc.state_event();
            ctls.broadcast(&line, now);
            tracing::info!("started {name} as pid {child}");
            Ok(())
        }
        Err(e) => {
            if let Some(id) = ctl_id {
                ctls.remove(id);
            }
            Err(e.into())
        }
    }
}

/// Advances one service's state machine until it settles. The original's
/// state-reentry jump becomes this loop.
pub fn tick_service(core: &mut Core, ctls: &mut ControllerSet, name: &str, now: Ts) {
    loop {
        let Some(svc) = core.services.get_mut(name) else {
            return;
        };
        match svc.state {
            SvcState::Down | SvcState::Up => return,
            SvcState::Reaped => {
                svc.state = SvcState::Down;
                let line = svc.state_event();
                core.services.release_pid(name);
                ctls.broadcast(&line, now);
                if core.term.shutting_down() {
                    return;
                }
                let Some(svc) = core.services.get_mut(name) else {
                    return;
                };
                let woken =
                    svc.wake_signals != 0 && core.signals.buckets.any_pending(svc.wake_signals);
                if svc.auto_restart || woken {
                    let when = svc.restart_after(now);
                    svc.state = SvcState::Start;
                    svc.start_at = if when > now { when } else { Ts::UNSET };
                    let line = svc.state_event();
                    ctls.broadcast(&line, now);
                    continue;
                }
                return;
            }
            SvcState::Start => {
                if svc.start_at.is_set() && svc.start_at > now {
                    return;
                }
                svc.start_at = Ts::UNSET;
                if let Err(e) = spawn_service(core, ctls, name, now) {
                    if e.category == Category::Internal {
                        core.term.fail_internal(&e.detail);
                    }
                    tracing::warn!("spawn {name}: {e}");
                    ctls.broadcast(&format!("error\t{e}"), now);
                    if let Some(svc) = core.services.get_mut(name) {
                        svc.start_at = now + FORK_RETRY_DELAY;
                    }
                }
                return;
            }
        }
    }
}

impl Supervisor {
    pub fn new(core: Core, ctls: ControllerSet, listener: Option<UnixListener>) -> Supervisor {
        Supervisor {
            core,
            ctls,
            listener,
        }
    }

    /// `--stdin`: the launching terminal or pipe pair is a controller.
    pub fn add_stdio_controller(&mut self) -> anyhow::Result<()> {
        let stdin = unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) }.try_clone_to_owned()?;
        let stdout = unsafe { BorrowedFd::borrow_raw(libc::STDOUT_FILENO) }.try_clone_to_owned()?;
        let ep = Endpoint::new(Some(stdin), Some(stdout))?;
        self.ctls.add(ep)?;
        Ok(())
    }

    /// `--config PATH`: the file's lines run through the ordinary
    /// dispatcher against a mute controller before the loop starts.
    pub fn feed_config(&mut self, path: &Path) -> anyhow::Result<()> {
        let text = std::fs::read_to_string(path)?;
        let id = self.ctls.add(Endpoint::new(None, None)?)?;
        let now = Ts::now();
        for line in text.lines() {
            command::dispatch(&mut self.core, &mut self.ctls, id, line, now);
        }
        self.ctls.remove(id);
        Ok(())
    }

    /// Runs until termination; the result is the process exit code.
    pub fn run(&mut self) -> anyhow::Result<i32> {
        loop {
            let now = Ts::now();
            self.core.signals.drain_wake();
            self.reap(now);
            self.drain_signals(now);
            self.arm_expired(now);
            self.tick_active(now);
            self.ctl_io(now);
            self.accept_pending();
            if let Some(code) = self.term_step(now) {
                return Ok(code);
            }
            self.poll_wait(now)?;
        }
    }

    /// `waitpid` until the kernel runs dry, routing exits through the pid
    /// index. Unknown pids are orphans we adopted as PID 1.
    pub fn reap(&mut self, now: Ts) {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.child_exited(pid, ExitStatus::Exited(code), now)
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    self.child_exited(pid, ExitStatus::Signaled(sig), now)
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::warn!("waitpid: {e}");
                    break;
                }
            }
        }
    }

    fn child_exited(&mut self, pid: nix::unistd::Pid, status: ExitStatus, now: Ts) {
        let Some(name) = self.core.services.name_of_pid(pid) else {
            tracing::debug!("reaped orphan pid {pid}");
            return;
        };
        let name = name.to_string();
        if let Some(svc) = self.core.services.get_mut(&name) {
            svc.wait_status = Some(status);
            svc.reap_time = now;
            svc.state = SvcState::Reaped;
        }
        self.core.services.mark_active(&name);
    }

    /// Fold handler counters into buckets, announce them, then walk the
    /// sigwake membership against the updated (level-triggered) state.
    fn drain_signals(&mut self, now: Ts) {
        let events = self.core.signals.drain(now);
        if events.is_empty() {
            return;
        }
        for ev in &events {
            let line = format!("signal\t{}\t{}\t{}", ev.sig.as_str(), ev.count, ev.ts);
            self.ctls.broadcast(&line, now);
        }
        if self.core.term.shutting_down() {
            return;
        }
        for name in self.core.services.sigwake_members() {
            let wake = self
                .core
                .services
                .get(&name)
                .map(|svc| self.core.signals.buckets.any_pending(svc.wake_signals))
                .unwrap_or(false);
            if wake {
                if let Err(e) = request_start(&mut self.core, &mut self.ctls, &name, now, now) {
                    tracing::warn!("sigwake {name}: {e}");
                }
            }
        }
    }

    /// Start timers that have come due re-enter the active queue.
    fn arm_expired(&mut self, now: Ts) {
        let due: Vec<String> = self
            .core
            .services
            .iter()
            .filter(|s| s.state == SvcState::Start && s.start_at.is_set() && s.start_at <= now)
            .map(|s| s.name.clone())
            .collect();
        for name in due {
            self.core.services.mark_active(&name);
        }
    }

    fn tick_active(&mut self, now: Ts) {
        for name in self.core.services.take_active() {
            tick_service(&mut self.core, &mut self.ctls, &name, now);
        }
    }

    /// Reads, dispatches and flushes every controller; advances statedump
    /// cursors one entry; applies the unresponsive watchdog; reaps dead
    /// endpoints.
    fn ctl_io(&mut self, now: Ts) {
        for id in self.ctls.ids() {
            let lines = match self.ctls.get_mut(id) {
                Some(ep) => ep.read_lines(now),
                None => continue,
            };
            for line in lines {
                command::dispatch(&mut self.core, &mut self.ctls, id, &line, now);
            }
            self.dump_step(id, now);
            if let Some(ep) = self.ctls.get_mut(id) {
                if ep.dropped
                    && ep.owner.is_some()
                    && ep.dropped_since.is_set()
                    && now >= ep.dropped_since + WATCHDOG_DELAY
                {
                    tracing::warn!("controller of {:?} unresponsive, closing", ep.owner);
                    ep.defunct = true;
                }
                ep.flush();
                if ep.defunct {
                    self.ctls.remove(id);
                }
            }
        }
    }

    /// One statedump entry per loop turn, so dumps interleave with live
    /// traffic instead of monopolizing the stream.
    pub fn dump_step(&mut self, id: usize, now: Ts) {
        loop {
            let Some(ep) = self.ctls.get_mut(id) else {
                return;
            };
            let Some(phase) = ep.dump.clone() else {
                return;
            };
            match phase {
                DumpPhase::Fds(last) => {
                    if let Some(entry) = self.core.fds.first_after(last.as_deref()) {
                        ep.queue_event(&entry.state_line(), now);
                        ep.dump = Some(DumpPhase::Fds(Some(entry.name.clone())));
                        return;
                    }
                    ep.dump = Some(DumpPhase::Services(None));
                }
                DumpPhase::Services(last) => {
                    if let Some(svc) = self.core.services.first_after(last.as_deref()) {
                        ep.queue_event(&svc.state_event(), now);
                        if let Some(args) = svc.vars.get(VAR_ARGS) {
                            ep.queue_event(&format!("service.args\t{}\t{args}", svc.name), now);
                        }
                        if let Some(fds) = svc.vars.get(VAR_FDS) {
                            ep.queue_event(&format!("service.fds\t{}\t{fds}", svc.name), now);
                        }
                        ep.queue_event(
                            &format!("service.opts\t{}{}", svc.name, render_service_opts(svc)),
                            now,
                        );
                        ep.dump = Some(DumpPhase::Services(Some(svc.name.clone())));
                        return;
                    }
                    ep.dump = Some(DumpPhase::Signals(Ts::UNSET));
                }
                DumpPhase::Signals(since) => {
                    let next = self
                        .core
                        .signals
                        .buckets
                        .events_since(since)
                        .into_iter()
                        .next();
                    match next {
                        Some(ev) => {
                            ep.queue_event(
                                &format!("signal\t{}\t{}\t{}", ev.sig.as_str(), ev.count, ev.ts),
                                now,
                            );
                            ep.dump = Some(DumpPhase::Signals(ev.ts));
                        }
                        None => {
                            ep.queue_event("statedump\tcomplete", now);
                            ep.dump = None;
                        }
                    }
                    return;
                }
            }
        }
    }

    fn accept_pending(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    let ep = stream
                        .as_fd()
                        .try_clone_to_owned()
                        .map_err(anyhow::Error::from)
                        .and_then(|in_fd| {
                            Ok(Endpoint::new(Some(in_fd), Some(OwnedFd::from(stream)))?)
                        });
                    match ep {
                        Ok(ep) => {
                            if let Err(e) = self.ctls.add(ep) {
                                tracing::warn!("rejecting controller: {e}");
                            }
                        }
                        Err(e) => tracing::warn!("controller setup failed: {e}"),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!("accept: {e}");
                    break;
                }
            }
        }
    }

    fn term_step(&mut self, now: Ts) -> Option<i32> {
        let any_running = self.core.services.iter().any(|s| s.is_running());
        let output_pending = self
            .ctls
            .ids()
            .into_iter()
            .any(|id| self.ctls.get(id).map(Endpoint::has_output).unwrap_or(false));
        match self.core.term.step(now, any_running, output_pending) {
            TermAction::None => None,
            TermAction::KillAll => {
                tracing::warn!("shutdown deadline passed, sending SIGKILL");
                signal_all(&self.core, Signal::SIGKILL);
                None
            }
            TermAction::Exit(code) => Some(code),
        }
    }

    /// The single suspension point. Timeout is the nearest of the start
    /// timers, the shutdown deadlines, the controller watchdogs, and
    /// "right now" if any statedump still has entries to push or a
    /// command marked a service active after this turn's tick.
    fn poll_wait(&mut self, now: Ts) -> anyhow::Result<()> {
        let mut deadline = self.core.services.next_wake();
        if self.core.services.has_active() {
            deadline = Some(now);
        }
        let mut merge = |d: Option<Ts>| {
            deadline = match (deadline, d) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, None) => a,
                (None, b) => b,
            };
        };
        merge(self.core.term.next_deadline());
        for id in self.ctls.ids() {
            if let Some(ep) = self.ctls.get(id) {
                if ep.dump.is_some() {
                    merge(Some(now));
                }
                if ep.dropped && ep.owner.is_some() && ep.dropped_since.is_set() {
                    merge(Some(ep.dropped_since + WATCHDOG_DELAY));
                }
            }
        }

        let timeout = match deadline {
            None => PollTimeout::NONE,
            Some(d) if d <= now => PollTimeout::ZERO,
            Some(d) => {
                let ms = (d - now).as_millis().saturating_add(1);
                PollTimeout::from(ms.min(u16::MAX as u64) as u16)
            }
        };

        let mut pfds = Vec::new();
        pfds.push(PollFd::new(self.core.signals.wake_fd(), PollFlags::POLLIN));
        if let Some(listener) = &self.listener {
            pfds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
        }
        for id in self.ctls.ids() {
            if let Some(ep) = self.ctls.get(id) {
                if let Some(fd) = ep.in_raw() {
                    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
                    pfds.push(PollFd::new(fd, PollFlags::POLLIN));
                }
                if ep.has_output() {
                    if let Some(fd) = ep.out_raw() {
                        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
                        pfds.push(PollFd::new(fd, PollFlags::POLLOUT));
                    }
                }
            }
        }

        match poll(&mut pfds, timeout) {
            Ok(_) => Ok(()),
            Err(Errno::EINTR) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// === Tests === //

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::Dur;
    use nix::fcntl::OFlag;
    use nix::unistd::{pipe2, read};

    fn test_core() -> Core {
        Core {
            services: ServiceTable::new(None, None),
            fds: FdTable::init(None).unwrap(),
            signals: SignalQueue::new().unwrap(),
            term: Terminator::new(false, None),
            log: LogControl::detached(),
        }
    }

    fn observer(ctls: &mut ControllerSet) -> (usize, OwnedFd) {
        let (rx, tx) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let id = ctls.add(Endpoint::new(None, Some(tx)).unwrap()).unwrap();
        (id, rx)
    }

    fn drain_events(ctls: &mut ControllerSet, id: usize, rx: &OwnedFd) -> Vec<String> {
        ctls.get_mut(id).unwrap().flush();
        let mut buf = [0u8; 4096];
        let mut out = Vec::new();
        if let Ok(n) = read(rx, &mut buf) {
            out.extend(
                String::from_utf8_lossy(&buf[..n])
                    .lines()
                    .map(String::from),
            );
        }
        out
    }

    #[test]
    fn spawn_reap_and_settle() {
        let mut core = test_core();
        let mut ctls = ControllerSet::new(None);
        let (id, rx) = observer(&mut ctls);

        core.services.get_or_create("t").unwrap();
        core.services
            .get_mut("t")
            .unwrap()
            .vars
            .set(VAR_ARGS, "/bin/true")
            .unwrap();

        let now = Ts::now();
        request_start(&mut core, &mut ctls, "t", now, now).unwrap();
        tick_service(&mut core, &mut ctls, "t", now);
        assert_eq!(core.services.get("t").unwrap().state, SvcState::Up);
        let pid = core.services.get("t").unwrap().pid.unwrap();
        assert_eq!(core.services.name_of_pid(pid), Some("t"));

        let mut sup = Supervisor::new(core, ctls, None);
        // /bin/true exits on its own; reap until the exit is routed
        for _ in 0..500 {
            let now = Ts::now();
            sup.reap(now);
            if sup.core.services.get("t").unwrap().state == SvcState::Reaped {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(sup.core.services.get("t").unwrap().state, SvcState::Reaped);

        let now = Ts::now();
        sup.tick_active(now);
        let svc = sup.core.services.get("t").unwrap();
        assert_eq!(svc.state, SvcState::Down);
        assert!(!svc.is_running());
        assert_eq!(svc.wait_status, Some(ExitStatus::Exited(0)));

        let events = drain_events(&mut sup.ctls, id, &rx);
        assert!(events.iter().any(|l| l.starts_with("service.state\tt\tup\t")));
        assert!(events
            .iter()
            .any(|l| l.starts_with("service.state\tt\tdown\t") && l.ends_with("exit=0")));
    }

    #[test]
    fn respawn_defers_by_interval() {
        let mut core = test_core();
        let mut ctls = ControllerSet::new(None);

        core.services.get_or_create("r").unwrap();
        {
            let svc = core.services.get_mut("r").unwrap();
            svc.vars.set(VAR_ARGS, "/bin/true").unwrap();
            svc.auto_restart = true;
            svc.restart_interval = Dur::from_secs(2);
        }

        let t0 = Ts::now();
        request_start(&mut core, &mut ctls, "r", t0, t0).unwrap();
        tick_service(&mut core, &mut ctls, "r", t0);
        let pid = core.services.get("r").unwrap().pid.unwrap();
        let _ = nix::sys::wait::waitpid(pid, None);

        // fake the routed exit moments after the start
        let t1 = t0 + Dur::parse("0.1").unwrap();
        {
            let svc = core.services.get_mut("r").unwrap();
            svc.wait_status = Some(ExitStatus::Exited(0));
            svc.reap_time = t1;
            svc.state = SvcState::Reaped;
        }
        tick_service(&mut core, &mut ctls, "r", t1);

        // died inside the interval: rescheduled, not immediately respawned
        let svc = core.services.get("r").unwrap();
        assert_eq!(svc.state, SvcState::Start);
        assert!(svc.start_at.is_set());
        assert_eq!(svc.start_at, t0 + Dur::from_secs(2));
        assert!(!svc.is_running());
    }

    #[test]
    fn spawn_failure_backs_off() {
        let mut core = test_core();
        let mut ctls = ControllerSet::new(None);
        let (id, rx) = observer(&mut ctls);

        // an fd name that doesn't resolve forces a spawn failure
        core.services.get_or_create("broken").unwrap();
        {
            let svc = core.services.get_mut("broken").unwrap();
            svc.vars.set(VAR_ARGS, "/bin/true").unwrap();
            svc.vars.set(VAR_FDS, "nosuchfd\tnull\tnull").unwrap();
        }

        let now = Ts::now();
        request_start(&mut core, &mut ctls, "broken", now, now).unwrap();
        tick_service(&mut core, &mut ctls, "broken", now);

        let svc = core.services.get("broken").unwrap();
        assert_eq!(svc.state, SvcState::Start);
        assert_eq!(svc.start_at, now + FORK_RETRY_DELAY);

        let events = drain_events(&mut ctls, id, &rx);
        assert!(events.iter().any(|l| l.starts_with("error\tnot-found\t")));
    }

    #[test]
    fn pending_trigger_signal_restarts_a_dying_service() {
        let mut core = test_core();
        let mut ctls = ControllerSet::new(None);

        core.services.get_or_create("w").unwrap();
        {
            let svc = core.services.get_mut("w").unwrap();
            svc.vars.set(VAR_ARGS, "/bin/true").unwrap();
            svc.wake_signals = 1 << Signal::SIGUSR1 as u32;
        }
        // a USR1 bucket is pending while the service dies: level-triggered
        // wake schedules another start even without auto-restart
        let mut counts = [0u32; 9];
        counts[3] = 1; // SIGUSR1
        core.signals.buckets.fold(&counts, Ts(5 << 32));
        let died_at = Ts(4 << 32) + Dur::parse("0.5").unwrap();
        {
            let svc = core.services.get_mut("w").unwrap();
            svc.start_time = Ts(4 << 32);
            svc.reap_time = died_at;
            svc.wait_status = Some(ExitStatus::Exited(1));
            svc.state = SvcState::Reaped;
        }
        tick_service(&mut core, &mut ctls, "w", died_at);
        // death inside the restart interval: rescheduled, timer armed
        let svc = core.services.get("w").unwrap();
        assert_eq!(svc.state, SvcState::Start);
        assert_eq!(svc.start_at, Ts(5 << 32));

        // cleared bucket: the same death settles down for good
        core.signals.buckets.clear(Signal::SIGUSR1, 1);
        {
            let svc = core.services.get_mut("w").unwrap();
            svc.state = SvcState::Reaped;
            svc.start_at = Ts::UNSET;
        }
        tick_service(&mut core, &mut ctls, "w", Ts(6 << 32));
        assert_eq!(core.services.get("w").unwrap().state, SvcState::Down);
    }

    #[test]
    fn statedump_walks_everything_and_completes() {
        let mut core = test_core();
        let mut ctls = ControllerSet::new(None);
        core.fds.pipe("log.r", "log.w").unwrap();
        core.services.get_or_create("a").unwrap();
        core.services
            .get_mut("a")
            .unwrap()
            .vars
            .set(VAR_ARGS, "/bin/a")
            .unwrap();
        core.services.get_or_create("b").unwrap();
        let counts = {
            let mut c = [0u32; 9];
            c[2] = 1; // SIGHUP's slot in the trapped set
            c
        };
        core.signals.buckets.fold(&counts, Ts(77 << 32));

        let (rx, tx) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let id = ctls.add(Endpoint::new(None, Some(tx)).unwrap()).unwrap();
        let mut sup = Supervisor::new(core, ctls, None);
        sup.ctls.get_mut(id).unwrap().dump = Some(DumpPhase::Fds(None));

        let mut all = Vec::new();
        for _ in 0..64 {
            let now = Ts::now();
            sup.dump_step(id, now);
            sup.ctls.get_mut(id).unwrap().flush();
            let mut buf = [0u8; 4096];
            match read(&rx, &mut buf) {
                Ok(n) if n > 0 => all.extend(
                    String::from_utf8_lossy(&buf[..n])
                        .lines()
                        .map(String::from),
                ),
                _ => {}
            }
            if sup.ctls.get(id).unwrap().dump.is_none() {
                break;
            }
        }

        assert!(all.iter().any(|l| l.starts_with("fd.state\tnull\tspecial")));
        assert!(all.iter().any(|l| l.starts_with("fd.state\tlog.r\tpipe-read\tlog.w")));
        assert!(all.iter().any(|l| l.starts_with("service.state\ta\t")));
        assert!(all.iter().any(|l| l.starts_with("service.args\ta\t/bin/a")));
        assert!(all.iter().any(|l| l.starts_with("service.state\tb\t")));
        assert!(all.iter().any(|l| l.starts_with("signal\tSIGHUP\t1\t77")));
        assert_eq!(all.last().unwrap(), "statedump\tcomplete");
    }
}
