use colored::Colorize;
use comfy_table::{presets::NOTHING, ContentArrangement, Table};

/// Print a decorated section header.
pub fn print_header(title: &str) {
    let line = "─".repeat(36);
    println!();
    println!("  {}", title.bold());
    println!("  {}", line.dimmed());
}

/// Loop state dot: ● running, ◐ paused/starting, ○ stopped.
pub fn state_dot(state: &str) -> String {
    match state {
        "running" => "●".green().to_string(),
        "paused" | "starting" | "stopping" => "◐".yellow().to_string(),
        _ => "○".dimmed().to_string(),
    }
}

fn fmt_score(v: Option<f64>) -> String {
    v.map_or_else(|| "-".to_string(), |s| format!("{s:.4}"))
}

/// Print the ranked population as a table.
pub fn print_top_k(entries: &[serde_json::Value]) {
    if entries.is_empty() {
        println!("  {}", "Population is empty.".dimmed());
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic);

    for (rank, entry) in entries.iter().enumerate() {
        let id = entry
            .get("policy_id")
            .and_then(|v| v.as_str())
            .unwrap_or("?");
        let score = entry.get("score").and_then(serde_json::Value::as_f64);
        let variance = entry.get("variance").and_then(serde_json::Value::as_f64);
        table.add_row(vec![
            format!("  #{}", rank + 1),
            id.bold().to_string(),
            fmt_score(score),
            format!("var {}", fmt_score(variance)).dimmed().to_string(),
        ]);
    }

    println!("{table}");
}

/// Print a control command outcome.
pub fn print_changed(action: &str, changed: bool) {
    if changed {
        println!("  {} {action} requested", "✓".green().bold());
    } else {
        println!("  {} {action}: already in effect", "·".dimmed());
    }
}

/// Create a styled spinner with a message.
pub fn spinner(msg: &str) -> indicatif::ProgressBar {
    let pb = indicatif::ProgressBar::new_spinner();
    if let Ok(style) = indicatif::ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template("  {spinner} {msg}")
    {
        pb.set_style(style);
    }
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_score() {
        assert_eq!(fmt_score(Some(0.61234)), "0.6123");
        assert_eq!(fmt_score(None), "-");
    }
}
