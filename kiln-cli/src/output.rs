//! Output formatting utilities for enhanced CLI experience.
//! 用于增强 CLI 体验的输出格式化工具。
//!
//! Colored terminal output and a spinner status line for the kiln CLI.
//! 为 kiln CLI 提供彩色终端输出和 spinner 状态行。

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

// ANSI color codes / ANSI 颜色代码
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const BLUE: &str = "\x1b[34m";
const CYAN: &str = "\x1b[36m";

/// Check if the terminal supports colors.
/// 检查终端是否支持颜色。
pub fn supports_color() -> bool {
    // Check NO_COLOR environment variable
    // 检查 NO_COLOR 环境变量
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }

    // Check if stdout is a terminal
    // 检查 stdout 是否为终端
    #[cfg(unix)]
    {
        unsafe { libc::isatty(libc::STDOUT_FILENO) != 0 }
    }

    #[cfg(not(unix))]
    {
        true
    }
}

/// Apply color if supported.
/// 如果支持则应用颜色。
fn colorize(color: &str, text: &str) -> String {
    if supports_color() {
        format!("{}{}{}", color, text, RESET)
    } else {
        text.to_string()
    }
}

/// Print a success message in green with checkmark.
/// 以绿色打印带有勾号的成功消息。
pub fn success(msg: &str) {
    let prefix = if supports_color() { "✓" } else { "[OK]" };
    println!("{} {}", colorize(GREEN, prefix), msg);
}

/// Print a warning message in yellow.
/// 以黄色打印警告消息。
pub fn warning(msg: &str) {
    let prefix = if supports_color() { "⚠" } else { "[WARN]" };
    eprintln!("{} {}", colorize(YELLOW, prefix), msg);
}

/// Print an error message in red.
/// 以红色打印错误消息。
pub fn error(msg: &str) {
    let prefix = if supports_color() { "✗" } else { "[ERROR]" };
    eprintln!("{} {}", colorize(RED, prefix), msg);
}

/// Print an info message in blue.
/// 以蓝色打印信息消息。
pub fn info(msg: &str) {
    let prefix = if supports_color() { "ℹ" } else { "[INFO]" };
    println!("{} {}", colorize(BLUE, prefix), msg);
}

/// Print a header with bold formatting.
/// 以粗体格式打印标题。
pub fn header(msg: &str) {
    println!("\n{}", colorize(BOLD, msg));
    if supports_color() {
        println!("{}", "─".repeat(msg.chars().count()));
    } else {
        println!("{}", "-".repeat(msg.len()));
    }
}

/// Print a key-value pair.
/// 打印键值对。
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", colorize(BOLD, key), value);
}

/// Print a list item.
/// 打印列表项。
pub fn list_item(item: &str) {
    let bullet = if supports_color() { "•" } else { "-" };
    println!("  {} {}", bullet, item);
}

/// Status indicator for long-running operations.
/// 长时间运行操作的状态指示器。
pub struct Status {
    message: String,
    done: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Status {
    /// Create a new status indicator.
    /// 创建新的状态指示器。
    pub fn new(message: &str) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = done.clone();
        let msg = message.to_string();

        let handle = if supports_color() {
            Some(thread::spawn(move || {
                let frames = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
                let mut i = 0;
                while !done_clone.load(Ordering::Relaxed) {
                    print!("\r{} {} ", colorize(CYAN, frames[i]), msg);
                    let _ = io::stdout().flush();
                    i = (i + 1) % frames.len();
                    thread::sleep(Duration::from_millis(80));
                }
            }))
        } else {
            print!("{} ... ", msg);
            let _ = io::stdout().flush();
            None
        };

        Self {
            message: message.to_string(),
            done,
            handle,
        }
    }

    /// Mark the operation as successful.
    /// 将操作标记为成功。
    pub fn success(self, msg: Option<&str>) {
        self.done.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle {
            let _ = h.join();
        }
        let final_msg = msg.unwrap_or(&self.message);
        if supports_color() {
            println!("\r{} {} ", colorize(GREEN, "✓"), final_msg);
        } else {
            println!("done");
        }
    }

    /// Mark the operation as failed.
    /// 将操作标记为失败。
    pub fn fail(self, msg: Option<&str>) {
        self.done.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle {
            let _ = h.join();
        }
        let final_msg = msg.unwrap_or(&self.message);
        if supports_color() {
            eprintln!("\r{} {} ", colorize(RED, "✗"), final_msg);
        } else {
            eprintln!("failed");
        }
    }
}
