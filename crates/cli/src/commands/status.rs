use anyhow::Result;
use colored::Colorize;

use crate::client::OverseerClient;
use crate::output;

fn text<'a>(health: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    health.get(key).and_then(|v| v.as_str())
}

/// "12s ago" for an RFC 3339 timestamp, or the raw text if it does not parse.
fn since(ts: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(ts)
        .map(|t| (chrono::Utc::now() - t.with_timezone(&chrono::Utc)).num_seconds())
        .map_or_else(|_| ts.to_string(), |s| format!("{s}s ago"))
}

pub async fn run(client: &OverseerClient, json_mode: bool) -> Result<()> {
    let sp = if json_mode { None } else { Some(output::spinner("Fetching loop health...")) };
    let health = client.health().await?;
    if let Some(sp) = sp {
        sp.finish_and_clear();
    }

    if json_mode {
        println!("{}", serde_json::to_string_pretty(&health)?);
        return Ok(());
    }

    let state = text(&health, "state").unwrap_or("unknown");
    let generation = health.get("generation").and_then(|v| v.as_u64()).unwrap_or(0);
    let safe_pause = health.get("safe_pause").and_then(|v| v.as_bool()).unwrap_or(false);

    output::print_header("Overseer Loop Health");

    println!("  {}     {} {}", "State:".dimmed(), output::state_dot(state), state);
    println!("  {}  {}", "Endpoint:".dimmed(), client.base_url());
    println!("  {}  {}", "Generation:".dimmed(), generation);
    println!(
        "  {}    {}",
        "Active:".dimmed(),
        text(&health, "active_policy_id").unwrap_or("-").bold()
    );
    if let Some(canary) = text(&health, "canary_policy_id") {
        println!("  {}    {}", "Canary:".dimmed(), canary.cyan());
    }
    println!(
        "  {}   {}",
        "Backend:".dimmed(),
        text(&health, "sim_backend").unwrap_or("-")
    );
    if let Some(progress) = health.get("progress").filter(|p| !p.is_null()) {
        let phase = text(progress, "phase").unwrap_or("?");
        let generation = progress.get("generation").and_then(|v| v.as_u64()).unwrap_or(0);
        let age = text(progress, "phase_started_at").map_or_else(String::new, |ts| {
            format!(" (entered {})", since(ts))
        });
        println!("  {}  gen {} {}{}", "In flight:".dimmed(), generation, phase.cyan(), age);
    }
    if let Some(ts) = text(&health, "heartbeat_at") {
        println!("  {} {}", "Heartbeat:".dimmed(), since(ts));
    }
    if let Some(autotune) = health.get("autotune").filter(|a| !a.is_null()) {
        let mode = text(autotune, "mode").unwrap_or("off");
        if mode != "off" {
            let workers = autotune
                .pointer("/knobs/max_parallel_workers")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            let action = text(autotune, "last_action").unwrap_or("none");
            println!(
                "  {}  {} ({} workers, last {})",
                "Autotune:".dimmed(),
                mode,
                workers,
                action
            );
        }
    }
    if safe_pause {
        println!(
            "  {} {}",
            "Safe-pause:".dimmed(),
            text(&health, "safe_pause_reason").unwrap_or("unknown").yellow()
        );
        println!(
            "              {}",
            "Fix the cause, then run `overseerctl resume`".dimmed()
        );
    }
    let recoveries = health.get("recoveries_30m").and_then(|v| v.as_u64()).unwrap_or(0);
    if recoveries > 0 {
        println!("  {} {} in window", "Failures:".dimmed(), format!("{recoveries}").red());
        if let Some(counts) = health.get("failure_counts").and_then(|v| v.as_object()) {
            for (kind, n) in counts {
                println!("              {} {}", kind.dimmed(), n);
            }
        }
    }
    if let Some(err) = text(&health, "last_error") {
        println!("  {} {}", "Last error:".dimmed(), err.red());
    }
    if let Some(ts) = text(&health, "last_success_ts") {
        println!("  {} {}", "Last gen:".dimmed(), since(ts));
    }
    println!();

    Ok(())
}
