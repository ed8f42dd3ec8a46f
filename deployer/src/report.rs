//! Operator-facing progress output
//!
//! Diagnostics go through `tracing`; this is the human report of what the
//! run is doing. A [`Reporter`] is passed to whatever needs to print, so
//! tests can capture the lines instead of reading stdout.

use std::sync::{Arc, Mutex};

use colored::Colorize;

#[derive(Debug, Clone)]
enum Sink {
    Stdout,
    Capture(Arc<Mutex<Vec<String>>>),
    Silent,
}

#[derive(Debug, Clone)]
pub struct Reporter {
    sink: Sink,
}

impl Reporter {
    /// Colored output on stdout
    pub fn stdout() -> Self {
        Self { sink: Sink::Stdout }
    }

    /// Keep plain lines in memory, see [`Reporter::lines`]
    pub fn capture() -> Self {
        Self {
            sink: Sink::Capture(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    pub fn silent() -> Self {
        Self { sink: Sink::Silent }
    }

    /// Step heading
    pub fn h1(&self, text: &str) {
        self.emit(text.to_string(), || {
            format!("{}\n", text.bold().underline().blue())
        });
    }

    /// Sub-step heading
    pub fn h2(&self, text: &str) {
        self.emit(text.to_string(), || format!("{}\n", text.bold()));
    }

    pub fn success(&self, text: &str) {
        self.emit(format!("* {}", text), || {
            format!("{}\n", format!("* {}", text).green())
        });
    }

    pub fn error(&self, text: &str) {
        self.emit(format!("x {}", text), || {
            format!("{}\n", format!("x {}", text).red())
        });
    }

    pub fn info(&self, text: &str) {
        self.emit(format!("  {}", text), || format!("  {}\n", text));
    }

    /// Captured lines, empty unless built with [`Reporter::capture`]
    pub fn lines(&self) -> Vec<String> {
        match &self.sink {
            Sink::Capture(lines) => lines
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            _ => Vec::new(),
        }
    }

    fn emit(&self, plain: String, colored: impl FnOnce() -> String) {
        match &self.sink {
            Sink::Stdout => println!("{}", colored()),
            Sink::Capture(lines) => lines
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(plain),
            Sink::Silent => {}
        }
    }
}
