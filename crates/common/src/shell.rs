// shell.rs

use std::io::{self, IsTerminal, Write};
use std::sync::{Mutex, OnceLock};

/// The output mode: either normal output or completely quiet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputMode {
    Normal,
    Quiet,
}

/// Choices for whether to use colored output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColorChoice {
    Auto,
    Always,
    Never,
}

/// A simple shell abstraction for user-facing output.
///
/// The record stream (one JSON object per line) goes to stdout; summaries,
/// warnings and errors go to stderr. Quiet mode silences the human-facing
/// channel but never the record stream, so piped runs stay scriptable.
#[derive(Debug)]
pub struct Shell {
    /// Verbosity level (currently unused, but available for expansion)
    pub verbosity: u8,
    /// Whether to output anything at all.
    pub output_mode: OutputMode,
    /// Whether to use colors.
    pub color_choice: ColorChoice,
}

impl Shell {
    /// Create a new shell with default settings.
    pub fn new() -> Self {
        Self {
            verbosity: 0,
            output_mode: OutputMode::Normal,
            color_choice: ColorChoice::Auto,
        }
    }

    /// Print a line (with a newline) to stdout. Not gated by quiet mode:
    /// stdout carries the machine-readable record stream.
    pub fn println_record(&mut self, msg: &str) -> io::Result<()> {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        writeln!(handle, "{}", msg)?;
        handle.flush()
    }

    /// Print a string to stderr.
    pub fn print_err(&mut self, msg: &str) -> io::Result<()> {
        if self.output_mode == OutputMode::Quiet {
            return Ok(());
        }
        let stderr = io::stderr();
        let mut handle = stderr.lock();
        write!(handle, "{}", msg)?;
        handle.flush()
    }

    /// Print a line (with a newline) to stderr.
    pub fn println_err(&mut self, msg: &str) -> io::Result<()> {
        if self.output_mode == OutputMode::Quiet {
            return Ok(());
        }
        let stderr = io::stderr();
        let mut handle = stderr.lock();
        writeln!(handle, "{}", msg)?;
        handle.flush()
    }

    /// Print a warning message.
    ///
    /// If colors are enabled, the "Warning:" prefix is printed in yellow.
    pub fn warn(&mut self, msg: &str) -> io::Result<()> {
        let formatted = if self.should_color() {
            format!("\x1b[33mWarning:\x1b[0m {}", msg)
        } else {
            format!("Warning: {}", msg)
        };
        self.println_err(&formatted)
    }

    /// Print an error message.
    ///
    /// If colors are enabled, the "Error:" prefix is printed in red.
    pub fn error(&mut self, msg: &str) -> io::Result<()> {
        let formatted = if self.should_color() {
            format!("\x1b[31mError:\x1b[0m {}", msg)
        } else {
            format!("Error: {}", msg)
        };
        self.println_err(&formatted)
    }

    /// Should we output with ANSI colors?
    fn should_color(&self) -> bool {
        match self.color_choice {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => io::stderr().is_terminal(),
        }
    }
}

impl Default for Shell {
    fn default() -> Self {
        Self::new()
    }
}

/// The global shell instance.
static GLOBAL_SHELL: OnceLock<Mutex<Shell>> = OnceLock::new();

/// Get a lock to the global shell.
///
/// This will initialize the shell with default values if it has not been set yet.
pub fn get_shell() -> std::sync::MutexGuard<'static, Shell> {
    GLOBAL_SHELL
        .get_or_init(|| Mutex::new(Shell::new()))
        .lock()
        .expect("global shell mutex is poisoned")
}

/// Print a formatted record line to stdout.
#[macro_export]
macro_rules! sh_record {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        $crate::shell::get_shell().println_record(&msg)
            .unwrap_or_else(|e| eprintln!("Error writing output: {}", e));
    }};
}

/// Print a formatted message (with a newline) to stderr.
#[macro_export]
macro_rules! sh_eprintln {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        $crate::shell::get_shell().println_err(&msg)
            .unwrap_or_else(|e| eprintln!("Error writing stderr: {}", e));
    }};
}

/// Print a warning message with a colored prefix.
#[macro_export]
macro_rules! sh_warn {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        $crate::shell::get_shell().warn(&msg)
            .unwrap_or_else(|e| eprintln!("Error writing stderr: {}", e));
    }};
}

/// Print an error message with a colored prefix.
#[macro_export]
macro_rules! sh_err {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        $crate::shell::get_shell().error(&msg)
            .unwrap_or_else(|e| eprintln!("Error writing stderr: {}", e));
    }};
}
