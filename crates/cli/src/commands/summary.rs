use anyhow::Result;
use colored::Colorize;

use crate::client::OverseerClient;
use crate::output;

pub async fn run(client: &OverseerClient, json_mode: bool) -> Result<()> {
    let Some(summary) = client.summary().await? else {
        if json_mode {
            println!("null");
        } else {
            println!("  {}", "No generation has completed yet.".dimmed());
        }
        return Ok(());
    };

    if json_mode {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let num = |key: &str| summary.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
    output::print_header(&format!("Generation {}", num("generation")));

    println!(
        "  {} {} proposed, {} evaluated, {} failed",
        "Candidates:".dimmed(),
        num("candidates"),
        num("evaluated").to_string().green(),
        if num("failed") > 0 {
            num("failed").to_string().red().to_string()
        } else {
            "0".to_string()
        }
    );
    let incumbent = summary
        .get("incumbent_score")
        .and_then(serde_json::Value::as_f64)
        .map_or_else(|| "-".to_string(), |s| format!("{s:.4}"));
    println!("  {}  {}", "Incumbent:".dimmed(), incumbent);

    if let Some(decision) = summary.get("decision") {
        let kind = decision.get("kind").and_then(|v| v.as_str()).unwrap_or("none");
        if kind != "none" {
            let policy = decision.get("policy_id").and_then(|v| v.as_str()).unwrap_or("-");
            let reason = decision.get("reason").and_then(|v| v.as_str()).unwrap_or("");
            let label = match kind {
                "promote" => kind.green().bold().to_string(),
                "rollback" => kind.red().bold().to_string(),
                _ => kind.cyan().to_string(),
            };
            println!("  {}     {} {}", "Canary:".dimmed(), label, policy);
            if !reason.is_empty() {
                println!("              {}", reason.dimmed());
            }
        }
    }
    println!();

    let entries = summary
        .get("top_k")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    output::print_top_k(&entries);
    println!();

    Ok(())
}
