//! Observer sinks recording the framed byte streams.
//!
//! One sink per direction. Whatever goes over the wire (chunk headers and
//! end-of-message markers included) is appended verbatim, so a recorded sink
//! is a replayable transcript of that direction.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;

/// An append-only byte destination shared by every session. Writes go
/// through a mutex so concurrent sessions never interleave inside a message.
#[derive(Clone)]
pub struct Sink {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Sink {
    pub fn stdout() -> Sink {
        Sink::from_writer(Box::new(io::stdout()))
    }

    pub fn file<P: AsRef<Path>>(path: P) -> anyhow::Result<Sink> {
        let file = File::create(path.as_ref())
            .with_context(|| format!("opening capture file {}", path.as_ref().display()))?;
        Ok(Sink::from_writer(Box::new(file)))
    }

    pub fn from_writer(writer: Box<dyn Write + Send>) -> Sink {
        Sink { writer: Arc::new(Mutex::new(writer)) }
    }

    /// Record one batch of framed bytes and flush, so a crash never loses a
    /// message that already went over the wire.
    pub fn record(&self, bytes: &[u8]) -> anyhow::Result<()> {
        // unwrap to propagate a poisoned lock as an unwind
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(bytes).context("writing capture")?;
        writer.flush().context("flushing capture")?;
        Ok(())
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        self.writer.lock().unwrap().flush().context("flushing capture")
    }
}
