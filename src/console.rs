//! Debug console: an MMIO register file that prints what the guest writes.
//!
//! | offset | access | meaning                                   |
//! |--------|--------|-------------------------------------------|
//! | 0x0    | write  | low byte is appended to the output        |
//! | 0x4    | read   | status, bit 0 set when ready (always)     |
//!
//! Output is flushed at every newline.

use crate::irq::VcpuId;
use crate::mmio::{RegisterDevice, Width};
use parking_lot::Mutex;
use std::io::Write;

/// Guest-physical base of the console in the binary's layout.
pub const CONSOLE_BASE: u64 = 0xd000_0000;
pub const CONSOLE_SIZE: u64 = 0x1000;

pub const REG_DATA: u64 = 0x0;
pub const REG_STATUS: u64 = 0x4;

const STATUS_READY: u64 = 1;

pub struct DebugConsole<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> DebugConsole<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write + Send> RegisterDevice for DebugConsole<W> {
    fn read(&self, offset: u64, _width: Width, _cpu: VcpuId) -> u64 {
        match offset {
            REG_STATUS => STATUS_READY,
            _ => 0,
        }
    }

    fn write(&self, offset: u64, _width: Width, value: u64, cpu: VcpuId) {
        if offset != REG_DATA {
            tracing::trace!(target: "dev", offset, %cpu, "console: write ignored");
            return;
        }

        let byte = value as u8;
        let mut out = self.out.lock();
        let mut written = out.write_all(&[byte]);
        if written.is_ok() && byte == b'\n' {
            written = out.flush();
        }
        if let Err(err) = written {
            tracing::warn!(target: "dev", "console output failed: {err}");
        }
    }
}
