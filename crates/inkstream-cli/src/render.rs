use inkstream_core::Notification;
use inkstream_sync::NotificationView;
use std::fmt::Write;

const MESSAGE_WIDTH: usize = 60;

/// Text rendering of the bell: badge line, then the newest entries.
pub fn render_bell(view: &NotificationView, limit: usize) -> String {
    let mut out = String::new();
    let Some(principal) = view.principal.as_deref() else {
        out.push_str("[bell] signed out");
        return out;
    };
    let _ = write!(
        out,
        "[bell] {} unread | {} | {}",
        view.unread, principal, view.channel
    );
    if view.loading {
        out.push_str(" | loading...");
    }
    if let Some(error) = &view.last_error {
        let _ = write!(out, "\n  error: {error}");
    }
    if let Some(notice) = &view.notice {
        let _ = write!(out, "\n  notice ({}): {}", notice.operation, notice.message);
    }
    if view.items.is_empty() && !view.loading {
        out.push_str("\n  no notifications");
    }
    for item in view.latest(limit) {
        out.push('\n');
        out.push_str(&render_row(item));
    }
    let hidden = view.items.len().saturating_sub(limit);
    if hidden > 0 {
        let _ = write!(out, "\n  ... {hidden} more");
    }
    out
}

fn render_row(item: &Notification) -> String {
    let marker = if item.is_unread() { '*' } else { ' ' };
    let mut row = format!(
        "  {marker} #{:<6} {}  {}",
        item.id,
        item.created_at.format("%Y-%m-%d %H:%M"),
        truncate(&item.message, MESSAGE_WIDTH)
    );
    if let Some(url) = &item.url {
        let _ = write!(row, "  -> {url}");
    }
    row
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(width.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}
