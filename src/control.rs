//! Controller endpoints: the byte streams the protocol runs over.
//!
//! An endpoint is a pair of nonblocking streams plus fixed-size line and
//! output buffers. Input longer than the buffer is dropped to the next
//! newline; output that cannot be buffered is dropped wholesale and
//! replaced by a single `overflow` marker once the peer drains. Both are
//! deliberate: the protocol is lossy-with-resync, and a slow controller
//! must never stall the supervisor.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::unistd::{read, write};

use crate::clock::Ts;
use crate::error::CmdError;

pub const CTL_BUF_SIZE: usize = 2048;

/// Where a statedump cursor currently points. One entry is emitted per
/// main-loop turn so dumps interleave with live events.
#[derive(Debug, Clone)]
pub enum DumpPhase {
    Fds(Option<String>),
    Services(Option<String>),
    Signals(Ts),
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

pub struct Endpoint {
    in_fd: Option<OwnedFd>,
    out_fd: Option<OwnedFd>,
    in_buf: Vec<u8>,
    in_overflow: bool,
    out_buf: Vec<u8>,
    /// True when the last byte written to the peer was not a newline, so
    /// the head of `out_buf` finishes an in-flight line.
    mid_line: bool,
    /// Output saturated; events are being discarded.
    pub dropped: bool,
    pub dropped_since: Ts,
    pub dump: Option<DumpPhase>,
    /// Set when this endpoint belongs to a service's control channel.
    pub owner: Option<String>,
    /// EOF or stream error observed; the supervisor tears it down.
    pub defunct: bool,
}

impl Endpoint {
    pub fn new(in_fd: Option<OwnedFd>, out_fd: Option<OwnedFd>) -> std::io::Result<Endpoint> {
        if let Some(fd) = &in_fd {
            set_nonblocking(fd.as_raw_fd())?;
        }
        if let Some(fd) = &out_fd {
            set_nonblocking(fd.as_raw_fd())?;
        }
        Ok(Endpoint {
            in_fd,
            out_fd,
            in_buf: Vec::with_capacity(CTL_BUF_SIZE),
            in_overflow: false,
            out_buf: Vec::with_capacity(CTL_BUF_SIZE),
            mid_line: false,
            dropped: false,
            dropped_since: Ts::UNSET,
            dump: None,
            owner: None,
            defunct: false,
        })
    }

    pub fn in_raw(&self) -> Option<RawFd> {
        self.in_fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn out_raw(&self) -> Option<RawFd> {
        self.out_fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn has_output(&self) -> bool {
        !self.out_buf.is_empty() || self.dropped
    }

    /// Reads what the stream has and returns every complete line.
    /// Overlength input drops to the next newline and queues one
    /// `overflow` marker.
    pub fn read_lines(&mut self, now: Ts) -> Vec<String> {
        let mut lines = Vec::new();
        // moved out for the duration so the buffers stay mutable
        let Some(in_fd) = self.in_fd.take() else {
            return lines;
        };

        let mut chunk = [0u8; 512];
        loop {
            match read(&in_fd, &mut chunk) {
                Ok(0) => {
                    self.defunct = true;
                    break;
                }
                Ok(n) => {
                    for &b in &chunk[..n] {
                        if self.in_overflow {
                            if b == b'\n' {
                                self.in_overflow = false;
                            }
                            continue;
                        }
                        if b == b'\n' {
                            lines.push(String::from_utf8_lossy(&self.in_buf).into_owned());
                            self.in_buf.clear();
                        } else {
                            self.in_buf.push(b);
                            if self.in_buf.len() >= CTL_BUF_SIZE - 1 {
                                self.in_buf.clear();
                                self.in_overflow = true;
                                self.queue_event("overflow", now);
                            }
                        }
                    }
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(_) => {
                    self.defunct = true;
                    break;
                }
            }
        }
        self.in_fd = Some(in_fd);
        lines
    }

    /// Appends one event line. Under saturation the event is discarded;
    /// the buffer is cut back to the in-flight line (if any) so the next
    /// thing a recovering peer sees is the `overflow` marker.
    pub fn queue_event(&mut self, line: &str, now: Ts) {
        if self.out_fd.is_none() || self.defunct || self.dropped {
            return;
        }
        if self.out_buf.len() + line.len() + 1 > CTL_BUF_SIZE {
            self.dropped = true;
            self.dropped_since = now;
            if self.mid_line {
                if let Some(end) = self.out_buf.iter().position(|&b| b == b'\n') {
                    self.out_buf.truncate(end + 1);
                }
            } else {
                self.out_buf.clear();
            }
            return;
        }
        self.out_buf.extend_from_slice(line.as_bytes());
        self.out_buf.push(b'\n');
    }

    /// Nonblocking flush. When the backlog fully drains after a drop
    /// episode, the single `overflow` marker is queued and streaming
    /// resumes.
    pub fn flush(&mut self) {
        if self.defunct {
            return;
        }
        let Some(out_fd) = self.out_fd.take() else {
            return;
        };
        loop {
            if self.out_buf.is_empty() {
                if self.dropped && !self.mid_line {
                    self.out_buf.extend_from_slice(b"overflow\n");
                    self.dropped = false;
                    self.dropped_since = Ts::UNSET;
                    continue;
                }
                break;
            }
            match write(&out_fd, &self.out_buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.mid_line = self.out_buf[n - 1] != b'\n';
                    self.out_buf.drain(..n);
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(_) => {
                    self.defunct = true;
                    break;
                }
            }
        }
        self.out_fd = Some(out_fd);
    }
}

/// The set of live controllers. Slot indices stay stable across removals
/// so in-flight dispatch can name its issuer.
pub struct ControllerSet {
    slots: Vec<Option<Endpoint>>,
    cap: Option<usize>,
}

impl ControllerSet {
    pub fn new(cap: Option<usize>) -> ControllerSet {
        ControllerSet {
            slots: Vec::new(),
            cap,
        }
    }

    pub fn add(&mut self, ep: Endpoint) -> Result<usize, CmdError> {
        if let Some(cap) = self.cap {
            let live = self.slots.iter().filter(|s| s.is_some()).count();
            if live >= cap {
                return Err(CmdError::limit("controller table full"));
            }
        }
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(ep);
                return Ok(i);
            }
        }
        self.slots.push(Some(ep));
        Ok(self.slots.len() - 1)
    }

    pub fn remove(&mut self, id: usize) -> Option<Endpoint> {
        self.slots.get_mut(id).and_then(Option::take)
    }

    pub fn get(&self, id: usize) -> Option<&Endpoint> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Endpoint> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    pub fn ids(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events go to every controller; each buffers or drops independently.
    pub fn broadcast(&mut self, line: &str, now: Ts) {
        for slot in self.slots.iter_mut().flatten() {
            slot.queue_event(line, now);
        }
    }

    /// Command responses go only to the issuing controller.
    pub fn send(&mut self, id: usize, line: &str, now: Ts) {
        if let Some(ep) = self.get_mut(id) {
            ep.queue_event(line, now);
        }
    }
}

// === Tests === //

#[cfg(test)]
mod test {
    use super::*;
    use nix::fcntl::OFlag;
    use nix::unistd::pipe2;

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        pipe2(OFlag::O_CLOEXEC).unwrap()
    }

    #[test]
    fn assembles_lines_across_reads() {
        let (rx, tx) = pipe_pair();
        let mut ep = Endpoint::new(Some(rx), None).unwrap();
        write(&tx, b"echo\thi\nstate").unwrap();
        assert_eq!(ep.read_lines(Ts(1)), vec!["echo\thi"]);
        write(&tx, b"dump\n").unwrap();
        assert_eq!(ep.read_lines(Ts(1)), vec!["statedump"]);
        assert!(!ep.defunct);
    }

    #[test]
    fn eof_marks_defunct() {
        let (rx, tx) = pipe_pair();
        let mut ep = Endpoint::new(Some(rx), None).unwrap();
        drop(tx);
        assert!(ep.read_lines(Ts(1)).is_empty());
        assert!(ep.defunct);
    }

    #[test]
    fn overlength_line_resyncs_at_newline() {
        let (rx, tx) = pipe_pair();
        let (out_rx, out_tx) = pipe_pair();
        let mut ep = Endpoint::new(Some(rx), Some(out_tx)).unwrap();

        let long = vec![b'x'; CTL_BUF_SIZE + 100];
        write(&tx, &long).unwrap();
        write(&tx, b" tail\necho\tok\n").unwrap();
        let lines = ep.read_lines(Ts(1));
        // the oversized line vanished; parsing resumed after its newline
        assert_eq!(lines, vec!["echo\tok"]);

        ep.flush();
        let mut buf = [0u8; 64];
        let n = read(&out_rx, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"overflow\n");
    }

    #[test]
    fn saturation_drops_then_marks_overflow() {
        let (out_rx, out_tx) = pipe_pair();
        let mut ep = Endpoint::new(None, Some(out_tx)).unwrap();

        // never flushed: fill the 2048-byte buffer past the brim
        let line = format!("service.state\tx\tup\t1\tpid=1\t{}", "p".repeat(100));
        for _ in 0..32 {
            ep.queue_event(&line, Ts(5));
        }
        assert!(ep.dropped);
        assert_eq!(ep.dropped_since, Ts(5));

        // events during the episode are discarded
        ep.queue_event("signal\tSIGHUP\t1\t7", Ts(7));

        // peer finally drains: the first thing it sees is the marker
        ep.flush();
        let mut buf = [0u8; CTL_BUF_SIZE];
        let n = read(&out_rx, &mut buf).unwrap();
        assert!(&buf[..n].starts_with(b"overflow\n"));
        assert!(!ep.dropped);

        // and streaming resumes afterwards
        ep.queue_event("echo\tback", Ts(9));
        ep.flush();
        let n = read(&out_rx, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"echo\tback\n");
    }

    #[test]
    fn slots_stay_stable_after_removal() {
        let mut set = ControllerSet::new(Some(2));
        let a = set.add(Endpoint::new(None, None).unwrap()).unwrap();
        let b = set.add(Endpoint::new(None, None).unwrap()).unwrap();
        assert!(set.add(Endpoint::new(None, None).unwrap()).is_err());
        set.remove(a);
        let c = set.add(Endpoint::new(None, None).unwrap()).unwrap();
        assert_eq!(c, a);
        assert!(set.get(b).is_some());
    }
}
