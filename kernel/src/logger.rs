//! Kernel logger
//!
//! Formats `log` records into a fixed in-memory ring (readable later for
//! crash dumps) and forwards each line to the console sink once one is
//! installed. Never allocates, and never blocks on its own locks: a record
//! logged while another core holds the ring is still sent to the sink.

use conquer_once::spin::OnceCell;
use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

const BUFFER_SIZE: usize = 8192;

/// Console output the logger forwards to (serial port, framebuffer, ...)
pub trait LogSink: Sync {
    fn write_str(&self, s: &str);
}

static SINK: OnceCell<&'static dyn LogSink> = OnceCell::uninit();

static LOGGER: KernelLogger = KernelLogger::new();

/// Most recent log output, oldest bytes overwritten first
struct LogBuffer {
    buffer: [u8; BUFFER_SIZE],
    /// Next write position
    head: usize,
    wrapped: bool,
}

impl LogBuffer {
    const fn new() -> Self {
        Self {
            buffer: [0; BUFFER_SIZE],
            head: 0,
            wrapped: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.buffer[self.head] = byte;
            self.head += 1;
            if self.head == BUFFER_SIZE {
                self.head = 0;
                self.wrapped = true;
            }
        }
    }

    /// Copy the contents, oldest first, into `out`
    fn copy_into(&self, out: &mut [u8]) -> usize {
        let (older, newer): (&[u8], &[u8]) = if self.wrapped {
            (&self.buffer[self.head..], &self.buffer[..self.head])
        } else {
            (&[], &self.buffer[..self.head])
        };
        let mut written = 0;
        for chunk in [older, newer] {
            let n = chunk.len().min(out.len() - written);
            out[written..written + n].copy_from_slice(&chunk[..n]);
            written += n;
        }
        written
    }
}

impl Write for LogBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push(s.as_bytes());
        Ok(())
    }
}

/// Adapter so `write!` can stream straight into the sink
struct SinkWriter(&'static dyn LogSink);

impl Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

pub struct KernelLogger {
    buffer: Mutex<LogBuffer>,
}

impl KernelLogger {
    const fn new() -> Self {
        KernelLogger {
            buffer: Mutex::new(LogBuffer::new()),
        }
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // try_lock: the tick handler may interrupt a core mid-record
        if let Some(mut buffer) = self.buffer.try_lock() {
            let _ = writeln!(&mut *buffer, "[{:>5}] {}: {}", record.level(), record.target(), record.args());
        }

        if let Some(sink) = SINK.get() {
            let _ = writeln!(
                SinkWriter(*sink),
                "[{:>5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Install the logger. Calling it again only changes the level.
pub fn init(level: LevelFilter) {
    // A second set_logger fails harmlessly
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

/// Attach the console. Only the first sink is kept.
pub fn set_sink(sink: &'static dyn LogSink) -> bool {
    SINK.try_init_once(|| sink).is_ok()
}

/// Copy buffered output, oldest first, into `out`; returns bytes copied
pub fn snapshot(out: &mut [u8]) -> usize {
    LOGGER.buffer.lock().copy_into(out)
}
