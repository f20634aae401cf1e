//! VM control interface.
//!
//! Management tooling inspects and drives a guest through [`VmControl`].
//! State-changing calls need write rights and report errors as negative
//! errno values, `0` meaning success.

use crate::guest::{Guest, State};
use std::fmt;

/// Guest status as seen by management tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Stopped,
    Shutdown,
    Crashed,
    Unknown,
}

impl From<State> for Status {
    fn from(state: State) -> Self {
        match state {
            State::Running => Status::Running,
            State::Stopped => Status::Stopped,
            State::Shutdown => Status::Shutdown,
            State::Crashed => Status::Crashed,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Running => "running",
            Status::Stopped => "stopped",
            Status::Shutdown => "shutdown",
            Status::Crashed => "crashed",
            Status::Unknown => "unknown",
        })
    }
}

/// Rights of the caller's control capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rights {
    pub write: bool,
}

impl Rights {
    pub const RO: Rights = Rights { write: false };
    pub const RW: Rights = Rights { write: true };
}

/// Control endpoint for one guest.
pub struct VmControl<'g, 'd> {
    guest: Option<&'g Guest<'d>>,
}

impl<'g, 'd> VmControl<'g, 'd> {
    pub fn new(guest: &'g Guest<'d>) -> Self {
        Self { guest: Some(guest) }
    }

    /// An endpoint whose guest is gone.
    pub fn detached() -> Self {
        Self { guest: None }
    }

    pub fn name(&self) -> String {
        self.guest.map(|g| g.name().to_string()).unwrap_or_default()
    }

    pub fn status(&self) -> Status {
        self.guest.map_or(Status::Unknown, |g| g.state().into())
    }

    /// vCPU run time in microseconds.
    pub fn vcpu_time(&self) -> u64 {
        self.guest.map_or(0, Guest::vcpu_time_us)
    }

    pub fn suspend(&self, rights: Rights) -> i64 {
        self.invoke(rights, |g| {
            g.suspend();
        })
    }

    pub fn resume(&self, rights: Rights) -> i64 {
        self.invoke(rights, |g| {
            g.resume();
        })
    }

    pub fn reset(&self, rights: Rights) -> i64 {
        self.invoke(rights, Guest::reset)
    }

    fn invoke(&self, rights: Rights, op: impl FnOnce(&Guest<'d>)) -> i64 {
        if !rights.write {
            return -i64::from(libc::EPERM);
        }
        let Some(guest) = self.guest else {
            return -i64::from(libc::ENODEV);
        };

        op(guest);
        0
    }
}
