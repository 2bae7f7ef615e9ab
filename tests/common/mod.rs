//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use reqlog::id::{ClockSource, IdGenerator, Settings};
use reqlog::middleware::{LogSink, Logger};

/// In-memory sink whose contents the test can read back.
#[derive(Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    pub fn sink(&self) -> LogSink {
        LogSink::new(self.clone())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    /// Access-log lines only, without handler log lines or comment lines.
    pub fn access_lines(&self) -> Vec<String> {
        self.text()
            .lines()
            .filter(|line| line.starts_with("[GIN] [") && line.contains("\x1b[0m|"))
            .map(str::to_owned)
            .collect()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A sink that rejects every write.
pub struct Broken;

impl Write for Broken {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "log collector gone"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn generator() -> Arc<IdGenerator> {
    Arc::new(IdGenerator::new(Settings::new().machine_id(0x2a)).expect("generator"))
}

pub fn logger(capture: &Capture) -> Logger {
    Logger::with_sink(generator(), capture.sink())
}

/// 2023-11-14T22:13:20Z, on a partition boundary.
pub const NOW_MS: u64 = 1_700_000_000_000;

/// Clock that moves only when set, or when the generator sleeps on it.
pub struct VirtualClock(AtomicU64);

impl VirtualClock {
    pub fn at(ms: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(ms)))
    }

    pub fn set(&self, ms: u64) {
        self.0.store(ms, Ordering::SeqCst);
    }
}

impl ClockSource for VirtualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        self.0.fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

pub fn generator_on(clock: &Arc<VirtualClock>) -> Arc<IdGenerator> {
    let settings = Settings::new().machine_id(0x2a).clock(clock.clone());
    Arc::new(IdGenerator::new(settings).expect("generator"))
}
