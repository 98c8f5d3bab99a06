//! 终端输出 (Console output)
//!
//! User-facing status lines. A `Console` value is created once in `main`,
//! passed by reference to whatever needs to talk to the user, and resets the
//! terminal colour when dropped.

use std::fmt::Display;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

const BLUE: &str = "\x1b[94m";
const YELLOW: &str = "\x1b[93m";
const RED: &str = "\x1b[91m";
const BOLD: &str = "\x1b[01m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Message,
    Warning,
    Error,
}

impl Level {
    fn color(self) -> &'static str {
        match self {
            Level::Message => BLUE,
            Level::Warning => YELLOW,
            Level::Error => RED,
        }
    }
}

pub struct Console {
    color: bool,
    out: Mutex<Box<dyn Write + Send>>,
}

impl Console {
    /// Console writing to stdout.
    pub fn new(color: bool) -> Self {
        Self::with_writer(io::stdout(), color)
    }

    pub fn with_writer(writer: impl Write + Send + 'static, color: bool) -> Self {
        Self {
            color,
            out: Mutex::new(Box::new(writer)),
        }
    }

    /// Colourless console whose output can be read back through the
    /// returned `Transcript`.
    pub fn capture() -> (Self, Transcript) {
        let transcript = Transcript::default();
        (Self::with_writer(transcript.clone(), false), transcript)
    }

    pub fn message(&self, text: impl Display) {
        self.emit(Level::Message, text);
    }

    pub fn warning(&self, text: impl Display) {
        self.emit(Level::Warning, text);
    }

    pub fn error(&self, text: impl Display) {
        self.emit(Level::Error, text);
    }

    /// Uncoloured line, used for multi-line job summaries.
    pub fn plain(&self, text: impl Display) {
        let Ok(mut out) = self.out.lock() else {
            return;
        };
        let _ = writeln!(out, "{}", text);
        let _ = out.flush();
    }

    pub fn emit(&self, level: Level, text: impl Display) {
        let Ok(mut out) = self.out.lock() else {
            return;
        };
        // 输出失败不影响批处理
        let _ = if self.color {
            writeln!(out, "{}{}{}{}", BOLD, level.color(), text, RESET)
        } else {
            writeln!(out, "{}", text)
        };
        let _ = out.flush();
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        if self.color {
            if let Ok(mut out) = self.out.lock() {
                let _ = write!(out, "{}", RESET);
                let _ = out.flush();
            }
        }
    }
}

/// In-memory sink shared between a capturing `Console` and the caller.
#[derive(Clone, Default)]
pub struct Transcript {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Transcript {
    pub fn contents(&self) -> String {
        match self.buffer.lock() {
            Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
            Err(_) => String::new(),
        }
    }
}

impl Write for Transcript {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self
            .buffer
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "transcript poisoned"))?;
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
