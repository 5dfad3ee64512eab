//! Log formatting and output with ANSI colors
//!
//! Handles:
//! - Colorized console output with tag and level columns
//! - Wrapping of long messages at word boundaries
//! - Dual output (console + file)
//! - Broken pipe handling for piped commands

use super::file::write_to_file;
use super::tags::LogTag;
use chrono::Local;
use colored::*;
use std::io::{stdout, ErrorKind, Write};

/// Column widths for alignment
const TAG_WIDTH: usize = 9;
const LEVEL_WIDTH: usize = 7;

/// Maximum line length before wrapping
const MAX_LINE_LENGTH: usize = 145;

/// Format and output a log message
pub fn format_and_log(tag: LogTag, level: &str, message: &str) {
    let now = Local::now();
    let time = now.format("%H:%M:%S").to_string().dimmed();

    let base_line = format!(
        "{} [{}] [{}] ",
        time,
        format_tag(&tag),
        format_level(level)
    );
    let prefix_width = strip_ansi_codes(&base_line).chars().count();
    let available = MAX_LINE_LENGTH.saturating_sub(prefix_width).max(50);

    let timestamp = now.format("%Y-%m-%d %H:%M:%S").to_string();
    let tag_clean = tag.to_plain_string();

    for (index, chunk) in wrap_text(message, available).iter().enumerate() {
        if index == 0 {
            print_stdout_safe(&format!("{}{}", base_line, chunk));
        } else {
            print_stdout_safe(&format!("{}{}", " ".repeat(prefix_width), chunk));
        }
        write_to_file(&format!("{} [{}] [{}] {}", timestamp, tag_clean, level, chunk));
    }
}

/// Format a tag with its color
fn format_tag(tag: &LogTag) -> ColoredString {
    let label = format!("{:<width$}", tag.to_plain_string(), width = TAG_WIDTH);
    match tag {
        LogTag::System => label.bright_yellow().bold(),
        LogTag::Service => label.bright_green().bold(),
        LogTag::Cluster => label.bright_cyan().bold(),
        LogTag::Events => label.bright_magenta().bold(),
        LogTag::Listener => label.bright_blue().bold(),
        LogTag::Session => label.bright_white().bold(),
        LogTag::Config => label.yellow().bold(),
        LogTag::License => label.bright_red().bold(),
        LogTag::Test => label.blue().bold(),
        LogTag::Other(_) => label.white().bold(),
    }
}

/// Format the level column with its color
fn format_level(level: &str) -> ColoredString {
    let label = format!("{:<width$}", level, width = LEVEL_WIDTH);
    match level {
        "ERROR" => label.bright_red().bold(),
        "WARNING" => label.bright_yellow().bold(),
        "DEBUG" | "VERBOSE" => label.dimmed(),
        _ => label.white().bold(),
    }
}

/// Print to stdout but ignore broken pipe errors
fn print_stdout_safe(message: &str) {
    let mut out = stdout().lock();
    if let Err(e) = writeln!(out, "{}", message).and_then(|_| out.flush()) {
        if e.kind() == ErrorKind::BrokenPipe {
            return;
        }
        let _ = writeln!(std::io::stderr(), "Logger stdout error: {}", e);
    }
}

/// Remove ANSI color codes from text
fn strip_ansi_codes(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut in_escape = false;

    for ch in text.chars() {
        if ch == '\x1b' {
            in_escape = true;
        } else if in_escape && ch == 'm' {
            in_escape = false;
        } else if !in_escape {
            result.push(ch);
        }
    }
    result
}

/// Wrap text at word boundaries, respecting existing newlines.
/// Words longer than the width are split hard.
fn wrap_text(text: &str, max_width: usize) -> Vec<String> {
    let mut result = Vec::new();

    for line in text.split('\n') {
        if line.chars().count() <= max_width {
            result.push(line.to_string());
            continue;
        }

        let mut current = String::new();
        for word in line.split_whitespace() {
            let mut word = word.to_string();
            while word.chars().count() > max_width {
                if !current.is_empty() {
                    result.push(std::mem::take(&mut current));
                }
                let split_at = word
                    .char_indices()
                    .nth(max_width)
                    .map(|(i, _)| i)
                    .unwrap_or(word.len());
                result.push(word[..split_at].to_string());
                word = word[split_at..].to_string();
            }

            if current.is_empty() {
                current = word;
            } else if current.chars().count() + word.chars().count() + 1 <= max_width {
                current.push(' ');
                current.push_str(&word);
            } else {
                result.push(std::mem::replace(&mut current, word));
            }
        }
        if !current.is_empty() {
            result.push(current);
        }
    }

    if result.is_empty() {
        result.push(String::new());
    }
    result
}
