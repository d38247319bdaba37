//! warden: a process supervisor usable as PID 1.
//!
//! Services are kept alive per policy, inherit descriptors from a named
//! registry, and everything is driven over a tab-separated line protocol
//! by any number of controllers. Single-threaded; the only blocking call
//! is the main loop's `poll`.

pub mod clock;
pub mod command;
pub mod control;
pub mod error;
pub mod fdtab;
pub mod logging;
pub mod options;
pub mod scan;
pub mod service;
pub mod signals;
pub mod supervisor;
pub mod term;
