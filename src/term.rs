//! Guarded termination: failsafe, the staged shutdown sequence, and
//! exec-on-exit.
//!
//! As PID 1 an accidental `terminate` is a kernel panic, so exit paths
//! are blocked by default until a controller proves knowledge of the
//! armed code. Shutdown runs TERM → wait → KILL → wait → drain, with the
//! exit code reporting how far it had to escalate.

use std::ffi::CString;

use crate::clock::{Dur, Ts};
use crate::error::CmdError;

pub const DEFAULT_TERM_WAIT: Dur = Dur(10 << 32);
pub const DEFAULT_KILL_WAIT: Dur = Dur(5 << 32);
pub const DEFAULT_DRAIN_WAIT: Dur = Dur(1 << 32);

/// Exit code when services needed SIGKILL.
pub const EXIT_KILLED: i32 = 10;
/// Exit code when a service refused to die entirely.
pub const EXIT_UNKILLABLE: i32 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    /// SIGTERM sent; waiting for services to exit.
    Term { deadline: Ts, t2: Dur, t3: Dur },
    /// SIGKILL sent; waiting again.
    Kill { deadline: Ts, t3: Dur },
    /// Services settled; flushing controller output.
    Drain { deadline: Ts, code: i32 },
    /// Exit immediately.
    Exit(i32),
}

/// What the main loop should do after a phase step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermAction {
    None,
    KillAll,
    Exit(i32),
}

pub struct Terminator {
    armed: bool,
    code: Option<String>,
    pub exec_on_exit: Vec<String>,
    pub phase: Phase,
}

impl Terminator {
    pub fn new(pid1: bool, prearm: Option<String>) -> Terminator {
        Terminator {
            armed: pid1 || prearm.is_some(),
            code: prearm,
            exec_on_exit: Vec::new(),
            phase: Phase::Running,
        }
    }

    pub fn failsafe_armed(&self) -> bool {
        self.armed
    }

    /// `failsafe + CODE`
    pub fn arm(&mut self, code: &str) {
        self.armed = true;
        self.code = Some(code.to_string());
    }

    /// `failsafe - CODE`: only the matching code disarms.
    pub fn disarm(&mut self, code: &str) -> Result<(), CmdError> {
        if !self.armed {
            return Err(CmdError::state("failsafe not armed"));
        }
        match &self.code {
            Some(stored) if stored == code => {
                self.armed = false;
                self.code = None;
                Ok(())
            }
            Some(_) => Err(CmdError::invalid("failsafe code mismatch")),
            None => Err(CmdError::invalid("failsafe armed without a code")),
        }
    }

    /// Gate for `terminate`/`shutdown`. A matching code passes; so does an
    /// armed exec-on-exit, which turns exit into a handoff.
    pub fn check_exit_allowed(&self, code: Option<&str>) -> Result<(), CmdError> {
        if !self.armed || !self.exec_on_exit.is_empty() {
            return Ok(());
        }
        match (code, &self.code) {
            (Some(given), Some(stored)) if given == stored => Ok(()),
            _ => Err(CmdError::state("failsafe")),
        }
    }

    pub fn request_terminate(&mut self, value: i32, code: Option<&str>) -> Result<(), CmdError> {
        self.check_exit_allowed(code)?;
        self.phase = Phase::Exit(value);
        Ok(())
    }

    /// Enters the shutdown sequence; the caller delivers the SIGTERMs.
    pub fn request_shutdown(
        &mut self,
        now: Ts,
        t1: Dur,
        t2: Dur,
        t3: Dur,
        code: Option<&str>,
    ) -> Result<(), CmdError> {
        self.check_exit_allowed(code)?;
        if !matches!(self.phase, Phase::Running) {
            return Err(CmdError::state("already shutting down"));
        }
        self.phase = Phase::Term {
            deadline: now + t1,
            t2,
            t3,
        };
        Ok(())
    }

    pub fn shutting_down(&self) -> bool {
        !matches!(self.phase, Phase::Running)
    }

    /// Advances the sequence given what the tables currently show.
    pub fn step(&mut self, now: Ts, any_running: bool, output_pending: bool) -> TermAction {
        match self.phase {
            Phase::Running => TermAction::None,
            Phase::Term { deadline, t2, t3 } => {
                if !any_running {
                    self.phase = Phase::Drain {
                        deadline: now + t3,
                        code: 0,
                    };
                    TermAction::None
                } else if now >= deadline {
                    self.phase = Phase::Kill {
                        deadline: now + t2,
                        t3,
                    };
                    TermAction::KillAll
                } else {
                    TermAction::None
                }
            }
            Phase::Kill { deadline, t3 } => {
                if !any_running {
                    self.phase = Phase::Drain {
                        deadline: now + t3,
                        code: EXIT_KILLED,
                    };
                    TermAction::None
                } else if now >= deadline {
                    self.phase = Phase::Drain {
                        deadline: now + t3,
                        code: EXIT_UNKILLABLE,
                    };
                    TermAction::None
                } else {
                    TermAction::None
                }
            }
            Phase::Drain { deadline, code } => {
                if !output_pending || now >= deadline {
                    TermAction::Exit(code)
                } else {
                    TermAction::None
                }
            }
            Phase::Exit(code) => TermAction::Exit(code),
        }
    }

    /// Earliest deadline the poll timeout must respect.
    pub fn next_deadline(&self) -> Option<Ts> {
        match self.phase {
            Phase::Running => None,
            Phase::Term { deadline, .. }
            | Phase::Kill { deadline, .. }
            | Phase::Drain { deadline, .. } => Some(deadline),
            Phase::Exit(_) => Some(Ts(1)),
        }
    }

    /// An internal assertion failure is fatal. Hands off to the armed
    /// replacement if there is one (so PID 1 survives as a process),
    /// otherwise aborts.
    pub fn fail_internal(&self, detail: &str) -> ! {
        tracing::error!("internal failure: {detail}");
        let _ = self.exec_or(0);
        std::process::abort()
    }

    /// Final breath: exec the armed replacement, or report `code` for a
    /// plain exit. Only returns if the exec failed or none was armed.
    pub fn exec_or(&self, code: i32) -> i32 {
        if self.exec_on_exit.is_empty() {
            return code;
        }
        let argv: Vec<CString> = self
            .exec_on_exit
            .iter()
            .filter_map(|a| CString::new(a.as_str()).ok())
            .collect();
        if argv.is_empty() {
            return code;
        }
        match nix::unistd::execvp(&argv[0], &argv) {
            Ok(infallible) => match infallible {},
            Err(e) => {
                tracing::error!("exec-on-exit failed: {e}");
                code
            }
        }
    }
}

// === Tests === //

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn failsafe_gate_as_pid1() {
        let mut t = Terminator::new(true, None);
        // armed by default: terminate is refused
        let err = t.request_terminate(0, None).unwrap_err();
        assert_eq!(err.category, crate::error::Category::State);
        assert_eq!(err.detail, "failsafe");

        // arming with a code and disarming with the wrong one fails
        t.arm("s3cret");
        assert!(t.disarm("WRONG").is_err());
        assert!(t.failsafe_armed());

        // the matching code disarms; terminate then proceeds
        t.disarm("s3cret").unwrap();
        t.request_terminate(0, None).unwrap();
        assert_eq!(t.phase, Phase::Exit(0));
    }

    #[test]
    fn matching_code_passes_the_gate_directly() {
        let mut t = Terminator::new(false, Some("k".into()));
        assert!(t.request_terminate(3, Some("nope")).is_err());
        t.request_terminate(3, Some("k")).unwrap();
        assert_eq!(t.phase, Phase::Exit(3));
    }

    #[test]
    fn exec_on_exit_bypasses_failsafe() {
        let mut t = Terminator::new(true, None);
        t.exec_on_exit = vec!["/sbin/fallback".into()];
        t.request_terminate(0, None).unwrap();
    }

    #[test]
    fn clean_shutdown_exits_zero() {
        let mut t = Terminator::new(false, None);
        let now = Ts(100 << 32);
        t.request_shutdown(now, Dur::from_secs(10), Dur::from_secs(5), Dur::from_secs(1), None)
            .unwrap();

        // services still up, deadline not reached
        assert_eq!(t.step(now, true, false), TermAction::None);

        // everything exited before t1: straight to drain, code 0
        let later = now + Dur::from_secs(2);
        assert_eq!(t.step(later, false, false), TermAction::None);
        assert_eq!(t.step(later, false, false), TermAction::Exit(0));
    }

    #[test]
    fn escalation_reports_ten_and_eleven() {
        let mut t = Terminator::new(false, None);
        let now = Ts(100 << 32);
        t.request_shutdown(now, Dur::from_secs(1), Dur::from_secs(1), Dur::from_secs(1), None)
            .unwrap();

        // t1 expires with services alive: SIGKILL round
        let after_t1 = now + Dur::from_secs(2);
        assert_eq!(t.step(after_t1, true, false), TermAction::KillAll);

        // they die after the kill: code 10
        assert_eq!(t.step(after_t1, false, false), TermAction::None);
        assert_eq!(t.step(after_t1, false, false), TermAction::Exit(EXIT_KILLED));

        // unkillable variant: kill deadline also expires
        let mut t = Terminator::new(false, None);
        t.request_shutdown(now, Dur::from_secs(1), Dur::from_secs(1), Dur::from_secs(1), None)
            .unwrap();
        assert_eq!(t.step(after_t1, true, false), TermAction::KillAll);
        let after_t2 = after_t1 + Dur::from_secs(2);
        assert_eq!(t.step(after_t2, true, false), TermAction::None);
        assert_eq!(t.step(after_t2, true, false), TermAction::Exit(EXIT_UNKILLABLE));
    }

    #[test]
    fn drain_respects_pending_output() {
        let mut t = Terminator::new(false, None);
        let now = Ts(100 << 32);
        t.request_shutdown(now, Dur::from_secs(1), Dur::from_secs(1), Dur::from_secs(5), None)
            .unwrap();
        assert_eq!(t.step(now, false, true), TermAction::None);
        // output still pending inside t3: keep draining
        assert_eq!(t.step(now + Dur::from_secs(1), false, true), TermAction::None);
        // t3 expired: exit anyway
        assert_eq!(
            t.step(now + Dur::from_secs(10), false, true),
            TermAction::Exit(0)
        );
    }
}
