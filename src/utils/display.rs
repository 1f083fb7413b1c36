use crate::core::message::{Message, Role};
use crate::storage::{LogEntry, LogKind};
use colored::*;

pub fn print_header(text: &str) {
    println!("\n{}", text.bright_cyan().bold());
    println!("{}", "=".repeat(text.len()).bright_cyan());
}

pub fn print_success(text: &str) {
    println!("{}", text.green());
}

pub fn print_error(text: &str) {
    eprintln!("{}", text.red().bold());
}

pub fn print_info(text: &str) {
    println!("{}", text.blue());
}

pub fn print_prompt(text: &str) {
    print!("{}", text.yellow().bold());
}

pub fn print_message(message: &Message) {
    let role = match message.role {
        Role::System => "system".magenta().bold(),
        Role::User => "user".yellow().bold(),
        Role::Assistant => "assistant".green().bold(),
    };
    println!(
        "{} {} {}",
        message.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
        role,
        message.content.as_text()
    );
}

pub fn print_log_entry(entry: &LogEntry) {
    let kind = match entry.kind {
        LogKind::Request => entry.kind.as_str().blue(),
        LogKind::Response => entry.kind.as_str().green(),
        LogKind::Error => entry.kind.as_str().red().bold(),
    };
    println!(
        "{} {:<8} {}:{} {}",
        entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
        kind,
        entry.user_id,
        entry.session_id,
        entry.request_id.as_deref().unwrap_or("-").dimmed()
    );
}
