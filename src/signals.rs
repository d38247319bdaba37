//! Signal capture: async-signal-safe accumulation feeding the main loop.
//!
//! The handler does the minimum legal work: bump a per-signal atomic
//! counter and write one byte to a self-pipe so `poll` wakes. The main
//! loop drains the counters into timestamped buckets; a bucket's pending
//! count only ever decreases through `signal.clear`, so a signal arriving
//! while a controller is mid-clear is never lost.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering::Relaxed};

use nix::fcntl::OFlag;
use nix::sys::signal::{sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, Signal, SigmaskHow};
use nix::unistd::{pipe2, read};

use crate::clock::Ts;
use crate::error::CmdError;

/// The trapped set. Everything else keeps its default disposition.
pub const TRAPPED: [Signal; 9] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGCHLD,
    Signal::SIGPIPE,
    Signal::SIGALRM,
    Signal::SIGQUIT,
];

const NSLOTS: usize = TRAPPED.len();

// handler-side state: counters bumped in signal context, swapped out by
// the main loop. the write end of the self-pipe is published here because
// the handler cannot capture anything.
static PENDING: [AtomicU32; NSLOTS] = [const { AtomicU32::new(0) }; NSLOTS];
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

fn slot_of(sig: Signal) -> Option<usize> {
    TRAPPED.iter().position(|s| *s == sig)
}

extern "C" fn on_signal(signo: libc::c_int) {
    if let Some(i) = TRAPPED.iter().position(|s| *s as libc::c_int == signo) {
        PENDING[i].fetch_add(1, Relaxed);
    }
    let fd = WAKE_FD.load(Relaxed);
    if fd >= 0 {
        // nonblocking; a full pipe already guarantees a wakeup
        unsafe { libc::write(fd, b"s".as_ptr() as *const libc::c_void, 1) };
    }
}

/// One `signal` event: the bucket's running total and first-seen stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigEvent {
    pub sig: Signal,
    pub count: u32,
    pub ts: Ts,
}

/// Main-loop-side buckets. Kept separate from the handler plumbing so the
/// accumulation rules are testable without installing handlers.
#[derive(Debug, Default)]
pub struct Buckets {
    slots: [(u32, Ts); NSLOTS],
}

impl Buckets {
    /// Folds freshly drained handler counts in, returning an event per
    /// bucket that changed.
    pub fn fold(&mut self, counts: &[u32; NSLOTS], now: Ts) -> Vec<SigEvent> {
        let mut events = Vec::new();
        for (i, &n) in counts.iter().enumerate() {
            if n == 0 {
                continue;
            }
            let (count, ts) = &mut self.slots[i];
            *count += n;
            if !ts.is_set() {
                *ts = now;
            }
            events.push(SigEvent {
                sig: TRAPPED[i],
                count: *count,
                ts: *ts,
            });
        }
        events
    }

    /// `signal.clear`: subtract, never zero blindly. An emptied bucket
    /// gives up its timestamp so the next arrival is "new" again.
    pub fn clear(&mut self, sig: Signal, n: u32) -> Option<SigEvent> {
        let i = slot_of(sig)?;
        let (count, ts) = &mut self.slots[i];
        *count = count.saturating_sub(n);
        if *count == 0 {
            *ts = Ts::UNSET;
        }
        Some(SigEvent {
            sig,
            count: *count,
            ts: *ts,
        })
    }

    pub fn pending(&self, sig: Signal) -> u32 {
        slot_of(sig).map(|i| self.slots[i].0).unwrap_or(0)
    }

    /// True if any signal in the bitset-by-signo mask has a nonzero
    /// bucket. This is what makes sigwake level-triggered.
    pub fn any_pending(&self, mask: u64) -> bool {
        self.slots
            .iter()
            .zip(TRAPPED.iter())
            .any(|(&(count, _), &sig)| count > 0 && mask & (1 << sig as u32) != 0)
    }

    /// Buckets whose first-seen stamp strictly exceeds `since`, in
    /// ascending stamp order.
    pub fn events_since(&self, since: Ts) -> Vec<SigEvent> {
        let mut out: Vec<SigEvent> = self
            .slots
            .iter()
            .zip(TRAPPED.iter())
            .filter_map(|(&(count, ts), &sig)| {
                (count > 0 && ts > since).then_some(SigEvent { sig, count, ts })
            })
            .collect();
        out.sort_by_key(|e| e.ts);
        out
    }
}

/// Installed capture state: the buckets plus the self-pipe.
pub struct SignalQueue {
    pub buckets: Buckets,
    wake_rx: OwnedFd,
    _wake_tx: OwnedFd,
}

impl SignalQueue {
    /// Creates the self-pipe and publishes its write end to the handler.
    /// Handlers themselves are trapped separately by [`trap_signals`].
    pub fn new() -> nix::Result<Self> {
        let (rx, tx) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        WAKE_FD.store(tx.as_fd().as_raw_fd(), Relaxed);
        Ok(Self {
            buckets: Buckets::default(),
            wake_rx: rx,
            _wake_tx: tx,
        })
    }

    pub fn wake_fd(&self) -> BorrowedFd<'_> {
        self.wake_rx.as_fd()
    }

    /// Empties the self-pipe. Must run before the counters are drained so
    /// a signal landing in between still leaves a readable byte.
    pub fn drain_wake(&self) {
        let mut buf = [0u8; 64];
        loop {
            match read(&self.wake_rx, &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }

    /// Swap-with-zero over the handler counters, folded into the buckets.
    pub fn drain(&mut self, now: Ts) -> Vec<SigEvent> {
        let mut counts = [0u32; NSLOTS];
        for (i, slot) in PENDING.iter().enumerate() {
            counts[i] = slot.swap(0, Relaxed);
        }
        self.buckets.fold(&counts, now)
    }
}

/// Traps the signal set. Call once, before any service is spawned.
pub fn trap_signals() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in TRAPPED {
        unsafe { sigaction(sig, &action)? };
    }
    Ok(())
}

/// Child-side reset between `fork` and `exec`: default dispositions and an
/// empty mask. Only async-signal-safe calls.
pub fn reset_for_child() {
    let dfl = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in TRAPPED {
        unsafe {
            let _ = sigaction(sig, &dfl);
        }
    }
    let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
}

/// Accepts `TERM` and `SIGTERM` alike.
pub fn parse_signal(name: &str) -> Result<Signal, CmdError> {
    let full;
    let name = if name.starts_with("SIG") {
        name
    } else {
        full = format!("SIG{name}");
        &full
    };
    name.parse::<Signal>()
        .map_err(|_| CmdError::invalid(format!("unknown signal {name}")))
}

// === Tests === //
