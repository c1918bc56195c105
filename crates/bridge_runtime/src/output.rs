//! Embedded runtime stdout/stderr handling.
//!
//! With redirection on, the runtime writes into [`TracingWriter`]s that turn
//! each line into a `tracing` event under the `embedded` target.

use std::io::{self, Write};

/// Longest line forwarded as a single event; longer lines are split.
const MAX_LINE: usize = 2048;

/// Which standard stream a writer stands in for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Line-buffered writer that forwards to `tracing`.
pub struct TracingWriter {
    stream: Stream,
    buf: Vec<u8>,
}

impl TracingWriter {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    fn emit(&self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        match self.stream {
            Stream::Stdout => tracing::info!(target: "embedded", "{}", line),
            Stream::Stderr => tracing::error!(target: "embedded", "{}", line),
        }
    }

    fn drain_lines(&mut self) {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.emit(&line[..line.len() - 1]);
        }
        while self.buf.len() >= MAX_LINE {
            let chunk: Vec<u8> = self.buf.drain(..MAX_LINE).collect();
            self.emit(&chunk);
        }
    }
}

impl Write for TracingWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        self.drain_lines();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            self.emit(&rest);
        }
        Ok(())
    }
}

impl Drop for TracingWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Output streams handed to the embedded runtime at start.
pub struct RuntimeOutput {
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
}

impl RuntimeOutput {
    pub fn new(redirect: bool) -> Self {
        if redirect {
            Self::redirected()
        } else {
            Self::inherited()
        }
    }

    /// Forward both streams to `tracing`.
    pub fn redirected() -> Self {
        Self {
            stdout: Box::new(TracingWriter::new(Stream::Stdout)),
            stderr: Box::new(TracingWriter::new(Stream::Stderr)),
        }
    }

    /// Use the process's own streams.
    pub fn inherited() -> Self {
        Self {
            stdout: Box::new(io::stdout()),
            stderr: Box::new(io::stderr()),
        }
    }
}

impl std::fmt::Debug for RuntimeOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeOutput").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_lines_and_keeps_partial() {
        let mut writer = TracingWriter::new(Stream::Stdout);
        write!(writer, "first\nsecond\npart").unwrap();
        assert_eq!(writer.buf, b"part");

        writer.write_all(b"ial\n").unwrap();
        assert!(writer.buf.is_empty());
    }

    #[test]
    fn test_long_line_is_chunked() {
        let mut writer = TracingWriter::new(Stream::Stderr);
        writer.write_all(&vec![b'x'; MAX_LINE * 2 + 10]).unwrap();
        assert_eq!(writer.buf.len(), 10);

        writer.flush().unwrap();
        assert!(writer.buf.is_empty());
    }

    #[test]
    fn test_redirected_output_accepts_writes() {
        let mut output = RuntimeOutput::new(true);
        writeln!(output.stdout, "hello").unwrap();
        writeln!(output.stderr, "oops").unwrap();
        output.stdout.flush().unwrap();
    }
}
