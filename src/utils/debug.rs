/*
 * Kernel Logging
 *
 * Backend for the `log` crate facade the rest of the kernel uses. Records
 * are rendered into a fixed ring buffer so the recent history is always
 * available post-mortem, and forwarded to a sink function when the (external)
 * serial driver has registered one.
 */

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Metadata, Record};
use spin::Mutex;

/// Bytes of log history kept in memory.
const RING_SIZE: usize = 64 * 1024;

/// Fixed-size byte ring. Old content is overwritten when full.
struct Ring {
    buf: [u8; RING_SIZE],
    head: usize,
    len: usize,
}

impl Ring {
    const fn new() -> Ring {
        Ring {
            buf: [0; RING_SIZE],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        self.buf[self.head] = byte;
        self.head = (self.head + 1) % RING_SIZE;
        if self.len < RING_SIZE {
            self.len += 1;
        }
    }

    fn copy_to(&self, out: &mut [u8]) -> usize {
        let n = self.len.min(out.len());
        let start = (self.head + RING_SIZE - self.len) % RING_SIZE;
        for (i, slot) in out.iter_mut().enumerate().take(n) {
            *slot = self.buf[(start + i) % RING_SIZE];
        }
        n
    }
}

static RING: Mutex<Ring> = Mutex::new(Ring::new());
static SINK: Mutex<Option<fn(&str)>> = Mutex::new(None);

struct RingWriter;

impl fmt::Write for RingWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut ring = RING.lock();
        for b in s.bytes() {
            ring.push(b);
        }

        if let Some(sink) = *SINK.lock() {
            sink(s);
        }

        Ok(())
    }
}

struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(RingWriter, "[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the kernel logger. Safe to call more than once; only the first
/// call wins, which lets the test harness and the boot path share it.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}

/// Register the serial (or other) sink that mirrors the ring.
pub fn set_sink(sink: fn(&str)) {
    *SINK.lock() = Some(sink);
}

/// Raw character output for the putch syscall.
pub fn put_char(c: u8) {
    let mut ring = RING.lock();
    ring.push(c);
    drop(ring);

    if let Some(sink) = *SINK.lock()
        && let Ok(s) = core::str::from_utf8(core::slice::from_ref(&c))
    {
        sink(s);
    }
}

/// Copy the buffered history into `out`, oldest first. Returns the byte
/// count.
pub fn history(out: &mut [u8]) -> usize {
    RING.lock().copy_to(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_the_tail() {
        let mut ring = Ring::new();
        for i in 0..(RING_SIZE + 10) {
            ring.push((i % 251) as u8);
        }

        let mut out = [0u8; RING_SIZE];
        let n = ring.copy_to(&mut out);
        assert_eq!(n, RING_SIZE);
        // oldest surviving byte is number 10
        assert_eq!(out[0], (10 % 251) as u8);
    }

    #[test]
    fn history_sees_log_output() {
        init();
        log::info!("ring smoke test marker");

        let mut out = [0u8; RING_SIZE];
        let n = history(&mut out);
        let s = core::str::from_utf8(&out[..n]).unwrap_or("");
        assert!(s.contains("ring smoke test marker"));
    }
}
