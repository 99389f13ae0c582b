//! Scoped duplication of console output into a log file.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// `Write` sink that forwards every byte to stdout and appends the same
/// bytes to a log file. Dropping the guard flushes the file; stdout itself
/// is never replaced, so nothing needs restoring afterwards.
pub struct LogCapture {
    file: File,
}

impl LogCapture {
    pub fn append_to(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()?;
        self.file.flush()
    }
}

impl Drop for LogCapture {
    fn drop(&mut self) {
        let _ = self.file.flush();
    }
}

/// Picks the sink command output goes through: a tee when a log file was
/// requested, plain stdout otherwise.
pub fn output_sink(log_file: Option<&Path>) -> io::Result<Box<dyn Write>> {
    match log_file {
        Some(path) => Ok(Box::new(LogCapture::append_to(path)?)),
        None => Ok(Box::new(io::stdout())),
    }
}
