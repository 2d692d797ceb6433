//! Terminal output helpers for the chat CLI.

use chat_engine::{ConnectionState, DeliveryState, MessageView};
use colored::Colorize;
use shared::ChatSession;
use tabled::{Table, Tabled};

#[derive(Tabled)]
struct SessionRow {
    #[tabled(rename = "")]
    initial: char,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Customer")]
    customer: String,
    #[tabled(rename = "Unread")]
    unread: String,
    #[tabled(rename = "Last Message")]
    last_message: String,
    #[tabled(rename = "Last Activity")]
    last_activity: String,
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

/// Print the session list as a table
pub fn print_sessions(sessions: &[ChatSession]) {
    if sessions.is_empty() {
        println!("No sessions found");
        return;
    }

    let rows: Vec<SessionRow> = sessions
        .iter()
        .map(|s| SessionRow {
            initial: s.avatar_initial(),
            id: s.id.to_string(),
            customer: s.customer_name.clone(),
            unread: if s.unread_count > 0 {
                s.unread_count.to_string()
            } else {
                "-".to_string()
            },
            last_message: s
                .last_message
                .as_ref()
                .map(|m| truncate(&m.content, 40))
                .unwrap_or_else(|| "-".to_string()),
            last_activity: s
                .last_activity()
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();
    println!("{}", Table::new(rows));
}

/// Print the unread total across all sessions, if any
pub fn print_unread_total(total: u32) {
    if total > 0 {
        println!("{} unread", total.to_string().bright_yellow().bold());
    }
}

/// Print one message line, with a sender header when it starts a group
pub fn print_message(view: &MessageView, counterpart: &str) {
    let message = &view.message;
    if view.group_start {
        let who = if view.is_mine {
            "You".bright_blue().bold()
        } else {
            counterpart.bright_green().bold()
        };
        println!();
        println!(
            "{} {}",
            who,
            message.created_at.format("%H:%M").to_string().dimmed()
        );
    }

    let marker = match message.state {
        DeliveryState::Pending => "…".dimmed(),
        DeliveryState::Sent => " ".normal(),
        DeliveryState::Failed => "!".bright_red().bold(),
    };
    println!("  {} {}", marker, message.content);
}

/// Print a note that a send was not confirmed
pub fn print_failed(view: &MessageView) {
    println!(
        "  {} {} {}",
        "✗".bright_red(),
        format!("Not delivered: \"{}\"", truncate(&view.message.content, 40)).red(),
        "(type /retry to resend)".dimmed()
    );
}

/// Print a connection state change
pub fn print_connection(state: ConnectionState) {
    let label = match state {
        ConnectionState::Connected => "● connected".bright_green(),
        ConnectionState::Connecting => "○ connecting…".yellow(),
        ConnectionState::Reconnecting => "○ reconnecting…".yellow(),
        ConnectionState::Disconnected => "● offline (type /open to reconnect)".bright_red(),
    };
    println!("{}", label);
}

/// Print the header shown when a conversation opens
pub fn print_chat_header(customer: &str) {
    println!();
    println!("  {} {}", "Chat with".dimmed(), customer.bright_white().bold());
    println!(
        "  {}",
        "/retry resend last failed · /open reconnect or switch · /sessions · /quit".dimmed()
    );
    println!();
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red(), message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("exactly ten", 11), "exactly ten");
        assert_eq!(truncate("this is far too long", 8), "this is…");
        assert_eq!(truncate("çàéèü", 3), "çà…");
    }
}
