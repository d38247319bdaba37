//! Named file descriptors that services inherit at launch.
//!
//! The table owns every descriptor it hands out except the three stdio
//! slots, which belong to the process. The four special names are created
//! at init and can never be deleted; launching a service must always be
//! able to plumb them.

use std::collections::BTreeMap;
use std::fs;
use std::ops::Bound::{Excluded, Unbounded};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use bitflags::bitflags;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;

use crate::error::CmdError;
use crate::scan::is_valid_name;

pub const FD_NULL: &str = "null";
pub const FD_STDIN: &str = "stdin";
pub const FD_STDOUT: &str = "stdout";
pub const FD_STDERR: &str = "stderr";

/// Names resolved per-service at fork time, never present in the table.
pub const CONTROL_SOCKET: &str = "control.socket";
pub const CONTROL_CMD: &str = "control.cmd";
pub const CONTROL_EVENT: &str = "control.event";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileFlags: u32 {
        const READ     = 1 << 0;
        const WRITE    = 1 << 1;
        const APPEND   = 1 << 2;
        const CREATE   = 1 << 3;
        const MKDIR    = 1 << 4;
        const NONBLOCK = 1 << 5;
        const SYNC     = 1 << 6;
        const TRUNC    = 1 << 7;
    }
}

impl FileFlags {
    pub fn parse(spec: &str) -> Result<FileFlags, CmdError> {
        let mut flags = FileFlags::empty();
        for word in spec.split(',').filter(|w| !w.is_empty()) {
            flags |= match word {
                "read" => FileFlags::READ,
                "write" => FileFlags::WRITE,
                "append" => FileFlags::APPEND,
                "create" => FileFlags::CREATE,
                "mkdir" => FileFlags::MKDIR,
                "nonblock" => FileFlags::NONBLOCK,
                "sync" => FileFlags::SYNC,
                "trunc" => FileFlags::TRUNC,
                other => return Err(CmdError::invalid(format!("unknown open flag {other}"))),
            };
        }
        if !flags.intersects(FileFlags::READ | FileFlags::WRITE | FileFlags::APPEND) {
            return Err(CmdError::invalid("open flags need read, write or append"));
        }
        Ok(flags)
    }

    pub fn render(&self) -> String {
        let names = [
            (FileFlags::READ, "read"),
            (FileFlags::WRITE, "write"),
            (FileFlags::APPEND, "append"),
            (FileFlags::CREATE, "create"),
            (FileFlags::MKDIR, "mkdir"),
            (FileFlags::NONBLOCK, "nonblock"),
            (FileFlags::SYNC, "sync"),
            (FileFlags::TRUNC, "trunc"),
        ];
        let mut out = String::new();
        for (flag, name) in names {
            if self.contains(flag) {
                if !out.is_empty() {
                    out.push(',');
                }
                out.push_str(name);
            }
        }
        out
    }
}

#[derive(Debug)]
pub enum FdKind {
    PipeRead { peer: String },
    PipeWrite { peer: String },
    File { flags: FileFlags, path: String },
    Special,
    Unknown { origin: Option<String> },
}

/// Either a descriptor we own or a process-lifetime stdio slot. The stdio
/// slots are never closed by the table.
#[derive(Debug)]
enum Desc {
    Owned(OwnedFd),
    Stdio(RawFd),
}

impl Desc {
    fn raw(&self) -> RawFd {
        match self {
            Desc::Owned(fd) => fd.as_raw_fd(),
            Desc::Stdio(fd) => *fd,
        }
    }
}

#[derive(Debug)]
pub struct FdEntry {
    pub name: String,
    pub kind: FdKind,
    desc: Desc,
}

impl FdEntry {
    pub fn raw_fd(&self) -> RawFd {
        self.desc.raw()
    }

    pub fn is_special(&self) -> bool {
        matches!(self.kind, FdKind::Special)
    }

    pub fn state_line(&self) -> String {
        match &self.kind {
            FdKind::PipeRead { peer } => format!("fd.state\t{}\tpipe-read\t{}", self.name, peer),
            FdKind::PipeWrite { peer } => format!("fd.state\t{}\tpipe-write\t{}", self.name, peer),
            FdKind::File { flags, path } => {
                format!("fd.state\t{}\tfile\t{}\t{}", self.name, flags.render(), path)
            }
            FdKind::Special => format!("fd.state\t{}\tspecial", self.name),
            FdKind::Unknown { origin: Some(o) } => {
                format!("fd.state\t{}\tunknown\t{}", self.name, o)
            }
            FdKind::Unknown { origin: None } => format!("fd.state\t{}\tunknown", self.name),
        }
    }
}

pub struct FdTable {
    entries: BTreeMap<String, FdEntry>,
    cap: Option<usize>,
}

impl FdTable {
    /// Builds the table and populates the four specials.
    pub fn init(cap: Option<usize>) -> std::io::Result<FdTable> {
        let mut table = FdTable {
            entries: BTreeMap::new(),
            cap,
        };
        let null = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open("/dev/null")?;
        table.insert_entry(FdEntry {
            name: FD_NULL.into(),
            kind: FdKind::Special,
            desc: Desc::Owned(null.into()),
        });
        for (name, fd) in [(FD_STDIN, 0), (FD_STDOUT, 1), (FD_STDERR, 2)] {
            table.insert_entry(FdEntry {
                name: name.into(),
                kind: FdKind::Special,
                desc: Desc::Stdio(fd),
            });
        }
        Ok(table)
    }

    fn insert_entry(&mut self, entry: FdEntry) {
        self.entries.insert(entry.name.clone(), entry);
    }

    pub fn get(&self, name: &str) -> Option<&FdEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Statedump resumption: the first entry strictly after `last`, or the
    /// first entry overall.
    pub fn first_after(&self, last: Option<&str>) -> Option<&FdEntry> {
        match last {
            None => self.entries.values().next(),
            Some(last) => self
                .entries
                .range::<str, _>((Excluded(last), Unbounded))
                .map(|(_, e)| e)
                .next(),
        }
    }

    /// Checks a would-be insert of `name` against name rules, specials and
    /// the pool cap.
    fn check_insert(&self, name: &str) -> Result<(), CmdError> {
        if !is_valid_name(name) {
            return Err(CmdError::invalid(format!("bad fd name {name}")));
        }
        match self.entries.get(name) {
            Some(e) if e.is_special() => {
                return Err(CmdError::state(format!("{name} is special")));
            }
            Some(_) => {}
            None => {
                if let Some(cap) = self.cap {
                    if self.entries.len() >= cap {
                        return Err(CmdError::limit("fd table full"));
                    }
                }
            }
        }
        Ok(())
    }

    /// `fd.pipe R W`: create a pipe, store both ends, drop (and close) any
    /// prior non-special entries of those names. Returns the two
    /// `fd.state` events.
    pub fn pipe(&mut self, read_name: &str, write_name: &str) -> Result<[String; 2], CmdError> {
        if read_name == write_name {
            return Err(CmdError::invalid("pipe ends need distinct names"));
        }
        self.check_insert(read_name)?;
        self.check_insert(write_name)?;
        if let Some(cap) = self.cap {
            let fresh = [read_name, write_name]
                .iter()
                .filter(|n| !self.entries.contains_key(**n))
                .count();
            if self.entries.len() + fresh > cap {
                return Err(CmdError::limit("fd table full"));
            }
        }

        let (rx, tx) = pipe2(OFlag::O_CLOEXEC)?;
        self.insert_entry(FdEntry {
            name: read_name.into(),
            kind: FdKind::PipeRead {
                peer: write_name.into(),
            },
            desc: Desc::Owned(rx),
        });
        self.insert_entry(FdEntry {
            name: write_name.into(),
            kind: FdKind::PipeWrite {
                peer: read_name.into(),
            },
            desc: Desc::Owned(tx),
        });
        Ok([
            self.entries[read_name].state_line(),
            self.entries[write_name].state_line(),
        ])
    }

    /// `fd.open NAME FLAGS PATH`. On failure the name is not created.
    pub fn open(&mut self, name: &str, flags: FileFlags, path: &str) -> Result<String, CmdError> {
        self.check_insert(name)?;

        if flags.contains(FileFlags::MKDIR) {
            if let Some(parent) = Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut opts = fs::OpenOptions::new();
        opts.read(flags.contains(FileFlags::READ))
            .write(flags.contains(FileFlags::WRITE))
            .append(flags.contains(FileFlags::APPEND))
            .create(flags.contains(FileFlags::CREATE))
            .truncate(flags.contains(FileFlags::TRUNC));
        let mut custom = libc::O_CLOEXEC;
        if flags.contains(FileFlags::NONBLOCK) {
            custom |= libc::O_NONBLOCK;
        }
        if flags.contains(FileFlags::SYNC) {
            custom |= libc::O_SYNC;
        }
        let file = opts.custom_flags(custom).open(path)?;

        self.insert_entry(FdEntry {
            name: name.into(),
            kind: FdKind::File {
                flags,
                path: path.into(),
            },
            desc: Desc::Owned(file.into()),
        });
        Ok(self.entries[name].state_line())
    }

    /// `fd.dup NEW OLD`: a second name for an existing descriptor.
    pub fn dup(&mut self, new_name: &str, old_name: &str) -> Result<String, CmdError> {
        self.check_insert(new_name)?;
        let old = self
            .entries
            .get(old_name)
            .ok_or_else(|| CmdError::not_found(format!("no fd named {old_name}")))?;
        let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(old.raw_fd()) }
            .try_clone_to_owned()?;
        self.insert_entry(FdEntry {
            name: new_name.into(),
            kind: FdKind::Unknown {
                origin: Some(old_name.into()),
            },
            desc: Desc::Owned(fd),
        });
        Ok(self.entries[new_name].state_line())
    }

    /// `fd.delete NAME`, refusing on specials.
    pub fn delete(&mut self, name: &str) -> Result<String, CmdError> {
        match self.entries.get(name) {
            None => Err(CmdError::not_found(format!("no fd named {name}"))),
            Some(e) if e.is_special() => Err(CmdError::state(format!("{name} is special"))),
            Some(_) => {
                self.entries.remove(name);
                Ok(format!("fd.state\t{name}\tdeleted"))
            }
        }
    }

    /// Re-opens any special whose descriptor has gone bad. Launches must
    /// always succeed in plumbing the specials.
    pub fn heal_specials(&mut self) {
        for name in [FD_NULL, FD_STDIN, FD_STDOUT, FD_STDERR] {
            let raw = match self.entries.get(name) {
                Some(e) => e.raw_fd(),
                None => continue,
            };
            if unsafe { libc::fcntl(raw, libc::F_GETFD) } != -1 {
                continue;
            }
            let reopened = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/null");
            let file = match reopened {
                Ok(f) => f,
                Err(e) => {
                    tracing::error!("cannot reopen /dev/null for {name}: {e}");
                    continue;
                }
            };
            if let Some(entry) = self.entries.get_mut(name) {
                match &entry.desc {
                    // stdio slots keep their numbers; move the fresh fd in
                    Desc::Stdio(slot) => {
                        unsafe { libc::dup2(file.as_fd().as_raw_fd(), *slot) };
                    }
                    Desc::Owned(_) => {
                        entry.desc = Desc::Owned(file.into());
                    }
                }
            }
        }
    }
}

// === Tests === //

#[cfg(test)]
mod test {
    use super::*;

    fn table() -> FdTable {
        FdTable::init(None).unwrap()
    }

    fn fd_is_open(fd: RawFd) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
    }

    #[test]
    fn specials_exist_and_resist_deletion() {
        let mut t = table();
        for name in [FD_NULL, FD_STDIN, FD_STDOUT, FD_STDERR] {
            assert!(t.get(name).unwrap().is_special());
            assert!(t.delete(name).is_err());
        }
        assert_eq!(t.len(), 4);
    }

    #[test]
    fn pipe_replacement_closes_old_ends() {
        let mut t = table();
        t.pipe("r", "w").unwrap();
        let old_r = t.get("r").unwrap().raw_fd();
        let old_w = t.get("w").unwrap().raw_fd();
        assert!(fd_is_open(old_r));

        // same names again: table shape identical, old descriptors gone
        let events = t.pipe("r", "w").unwrap();
        assert!(events[0].starts_with("fd.state\tr\tpipe-read\tw"));
        assert!(events[1].starts_with("fd.state\tw\tpipe-write\tr"));
        assert!(!fd_is_open(old_r));
        assert!(!fd_is_open(old_w));
        assert_eq!(t.len(), 6);
    }

    #[test]
    fn pipe_rejects_special_and_duplicate_names() {
        let mut t = table();
        assert!(t.pipe("stdin", "w").is_err());
        assert!(t.pipe("x", "x").is_err());
    }

    #[test]
    fn pool_cap_is_a_limit_error() {
        let mut t = FdTable::init(Some(5)).unwrap();
        // four specials already present, so a pipe (two entries) busts it
        let err = t.pipe("r", "w").unwrap_err();
        assert_eq!(err.category, crate::error::Category::Limit);
    }

    #[test]
    fn open_failure_creates_nothing() {
        let mut t = table();
        let flags = FileFlags::parse("read").unwrap();
        assert!(t.open("log", flags, "/nonexistent/dir/file").is_err());
        assert!(t.get("log").is_none());
    }

    #[test]
    fn open_and_delete_file() {
        let mut t = table();
        let path = std::env::temp_dir().join("warden-fdtab-test");
        let flags = FileFlags::parse("write,create,trunc").unwrap();
        let ev = t.open("out", flags, path.to_str().unwrap()).unwrap();
        assert!(ev.starts_with("fd.state\tout\tfile\twrite,create,trunc\t"));
        let raw = t.get("out").unwrap().raw_fd();
        assert!(fd_is_open(raw));
        t.delete("out").unwrap();
        assert!(!fd_is_open(raw));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn dup_tracks_origin() {
        let mut t = table();
        t.pipe("r", "w").unwrap();
        let ev = t.dup("w2", "w").unwrap();
        assert_eq!(ev, "fd.state\tw2\tunknown\tw");
        assert_ne!(t.get("w2").unwrap().raw_fd(), t.get("w").unwrap().raw_fd());
    }

    #[test]
    fn flag_parsing() {
        assert!(FileFlags::parse("read,nonblock").is_ok());
        assert!(FileFlags::parse("bogus").is_err());
        assert!(FileFlags::parse("create").is_err(), "no access mode");
        let f = FileFlags::parse("read,write,sync").unwrap();
        assert_eq!(f.render(), "read,write,sync");
    }

    #[test]
    fn first_after_walks_in_name_order() {
        let mut t = table();
        t.pipe("a.r", "a.w").unwrap();
        let mut seen = Vec::new();
        let mut last: Option<String> = None;
        while let Some(e) = t.first_after(last.as_deref()) {
            seen.push(e.name.clone());
            last = Some(e.name.clone());
        }
        assert_eq!(seen, vec!["a.r", "a.w", "null", "stderr", "stdin", "stdout"]);
    }
}
