// Console output for the daemon's startup and shutdown path. Structured
// logging goes through tracing; these lines are for the human watching the
// terminal.

use std::env;

/// ANSI color codes
pub struct Colors;

impl Colors {
    pub const MAIN: &'static str = "\x1b[38;2;95;173;235m";
    pub const DIM_GRAY: &'static str = "\x1b[38;2;128;128;128m";
    pub const ERROR: &'static str = "\x1b[38;2;255;59;48m";
    pub const WARNING: &'static str = "\x1b[38;2;255;149;0m";
    pub const RESET: &'static str = "\x1b[0m";
}

/// Unicode symbols for different message types
pub struct Symbols;

impl Symbols {
    pub const SUCCESS: &'static str = "✓";
    pub const ERROR: &'static str = "✗";
    pub const WARNING: &'static str = "!";
    pub const INFO: &'static str = "ℹ";
}

pub struct ConsoleLogger;

impl ConsoleLogger {
    fn quiet() -> bool {
        env::var("NETMUX_QUIET").is_ok()
    }

    pub fn success(message: &str) {
        if !Self::quiet() {
            println!("{}{} {}{}", Colors::MAIN, Symbols::SUCCESS, message, Colors::RESET);
        }
    }

    pub fn info(message: &str) {
        if !Self::quiet() {
            println!("{}{} {}{}", Colors::DIM_GRAY, Symbols::INFO, message, Colors::RESET);
        }
    }

    pub fn warning(message: &str) {
        if !Self::quiet() {
            println!("{}{} {}{}", Colors::WARNING, Symbols::WARNING, message, Colors::RESET);
        }
    }

    /// Errors always print, quiet or not, to stderr.
    pub fn error(message: &str) {
        eprintln!("{}{} {}{}", Colors::ERROR, Symbols::ERROR, message, Colors::RESET);
    }
}
