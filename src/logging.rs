//! Supervisor-side logging.
//!
//! Everything diagnostic goes through `tracing`. The subscriber is built
//! once with a reloadable level filter and a writer whose destination
//! descriptor can be swapped at runtime, which is all `log.filter` and
//! `log.dest` need to do.

use std::io::{self, Write};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;

/// The `log.filter +`/`-` ladder, least to most verbose.
const LEVELS: [LevelFilter; 6] = [
    LevelFilter::OFF,
    LevelFilter::ERROR,
    LevelFilter::WARN,
    LevelFilter::INFO,
    LevelFilter::DEBUG,
    LevelFilter::TRACE,
];

fn unpoison<T>(result: Result<T, std::sync::PoisonError<T>>) -> T {
    result.unwrap_or_else(|e| e.into_inner())
}

/// Writer handing each formatted line to the current destination: a named
/// fd's descriptor, or stderr when none is set. Write errors are eaten;
/// logging must never take the supervisor down.
#[derive(Clone, Default)]
struct SharedDest(Arc<Mutex<Option<RawFd>>>);

impl Write for SharedDest {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let dest = *unpoison(self.0.lock());
        match dest {
            Some(fd) => {
                let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
                if n < 0 {
                    // swallow; pretend the line went out
                    Ok(buf.len())
                } else {
                    Ok(n as usize)
                }
            }
            None => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SharedDest {
    type Writer = SharedDest;

    fn make_writer(&'a self) -> SharedDest {
        self.clone()
    }
}

pub struct LogControl {
    handle: Option<reload::Handle<LevelFilter, Registry>>,
    level: usize,
    dest: Arc<Mutex<Option<RawFd>>>,
}

/// Steps the ladder one notch. Saturates at both ends.
fn step(level: usize, more_verbose: bool) -> usize {
    if more_verbose {
        (level + 1).min(LEVELS.len() - 1)
    } else {
        level.saturating_sub(1)
    }
}

impl LogControl {
    /// Installs the global subscriber. Call once, from main.
    pub fn init(initial: LevelFilter) -> LogControl {
        let level = LEVELS.iter().position(|l| *l == initial).unwrap_or(3);
        let (filter, handle) = reload::Layer::new(LEVELS[level]);
        let dest = Arc::new(Mutex::new(None));
        let writer = SharedDest(dest.clone());
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(writer),
            )
            .init();
        LogControl {
            handle: Some(handle),
            level,
            dest,
        }
    }

    /// A control block with no installed subscriber; level changes are
    /// tracked but go nowhere. Used where the global subscriber belongs
    /// to someone else (tests).
    pub fn detached() -> LogControl {
        LogControl {
            handle: None,
            level: 3,
            dest: Arc::new(Mutex::new(None)),
        }
    }

    /// `log.filter +` / `log.filter -`. Returns the new level's name.
    pub fn adjust(&mut self, more_verbose: bool) -> &'static str {
        self.level = step(self.level, more_verbose);
        let filter = LEVELS[self.level];
        if let Some(handle) = &self.handle {
            if let Err(e) = handle.reload(filter) {
                tracing::error!("cannot reload log filter: {e}");
            }
        }
        level_name(self.level)
    }

    /// `log.dest NAMED-FD`: all subsequent lines go to this descriptor.
    /// The fd table keeps the descriptor alive; if it is later deleted the
    /// writer falls back to dropping lines, never to blocking.
    pub fn set_dest(&mut self, fd: Option<RawFd>) {
        *unpoison(self.dest.lock()) = fd;
    }
}

fn level_name(level: usize) -> &'static str {
    ["off", "error", "warn", "info", "debug", "trace"][level]
}

// === Tests === //

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ladder_saturates() {
        let mut level = 3; // info
        level = step(level, true);
        assert_eq!(level_name(level), "debug");
        for _ in 0..10 {
            level = step(level, true);
        }
        assert_eq!(level_name(level), "trace");
        for _ in 0..10 {
            level = step(level, false);
        }
        assert_eq!(level_name(level), "off");
    }
}
