//! Phase log: the user-facing output of a build or rebase.
//!
//! Lines are recorded with the phase that produced them and echoed to
//! stdout unless the log is quiet.

use std::fmt;
use std::io::Write;

use parking_lot::Mutex;

/// Which step produced a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Detect,
    Analyze,
    Build,
    Export,
    Rebase,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Setup => "setup",
            Phase::Detect => "detect",
            Phase::Analyze => "analyze",
            Phase::Build => "build",
            Phase::Export => "export",
            Phase::Rebase => "rebase",
        };
        f.write_str(name)
    }
}

/// One recorded line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub phase: Phase,
    pub line: String,
    pub time: String,
}

#[derive(Debug, Default)]
pub struct PhaseLog {
    quiet: bool,
    lines: Mutex<Vec<LogLine>>,
}

impl PhaseLog {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn line(&self, phase: Phase, line: impl Into<String>) {
        let line = line.into();
        if !self.quiet {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{}", line);
        }
        self.lines.lock().push(LogLine {
            phase,
            line,
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        });
    }

    /// Container output, prefixed with the phase like `[build] ...`.
    pub fn output(&self, phase: Phase, lines: &[String]) {
        for line in lines {
            self.line(phase, format!("[{}] {}", phase, line));
        }
    }

    /// Every line recorded so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().map(|l| l.line.clone()).collect()
    }

    pub fn entries(&self) -> Vec<LogLine> {
        self.lines.lock().clone()
    }

    /// All lines of one phase.
    pub fn phase(&self, phase: Phase) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|l| l.phase == phase)
            .map(|l| l.line.clone())
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|l| l.line.contains(needle))
    }
}
