//! Console output.
//!
//! Every status line is ` * (<time>) <message>` with a coloured star. Text
//! that came from a peer is escaped first so it cannot drive the terminal.

use chrono::{DateTime, Local};
use colored::{Color, Colorize};
use std::io::Write;

/// Category of a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Info,
    Warn,
    Alert,
    Critical,
}

impl Category {
    fn color(self) -> Color {
        match self {
            Self::Info => Color::Blue,
            Self::Warn => Color::Magenta,
            Self::Alert | Self::Critical => Color::Red,
        }
    }
}

/// Replace DEL and control characters other than tab with `?`.
pub fn escape(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c == '\u{7f}' || (c < ' ' && c != '\t') {
                '?'
            } else {
                c
            }
        })
        .collect()
}

/// `3:04PM` style clock.
pub fn kitchen_time(at: DateTime<Local>) -> String {
    at.format("%-I:%M%p").to_string()
}

/// Render one status line without a trailing newline.
pub fn format_line(category: Category, msg: &str, at: DateTime<Local>) -> String {
    let body = escape(msg);
    let body = if category == Category::Critical {
        body.red().to_string()
    } else {
        body
    };
    format!(
        " {} ({}) {}",
        "*".color(category.color()),
        kitchen_time(at),
        body
    )
}

fn emit(category: Category, msg: &str) {
    let line = format_line(category, msg, Local::now());
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

pub fn info(msg: &str) {
    emit(Category::Info, msg);
}

pub fn warn(msg: &str) {
    emit(Category::Warn, msg);
}

pub fn alert(msg: &str) {
    emit(Category::Alert, msg);
}

/// Print and exit with status 1.
pub fn critical(msg: &str) -> ! {
    emit(Category::Critical, msg);
    std::process::exit(1);
}

/// A chat line from a peer.
pub fn message(from: &str, text: &str) {
    println!("{}: {}", escape(from).bold(), escape(text));
}

/// Our own line, echoed after it was queued.
pub fn echo(text: &str) {
    println!("{} {}", ">".dimmed(), escape(text));
}
