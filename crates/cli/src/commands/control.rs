use anyhow::Result;

use crate::client::OverseerClient;
use crate::output;

fn report(action: &str, changed: bool, json_mode: bool) -> Result<()> {
    if json_mode {
        let data = serde_json::json!({ "action": action, "changed": changed });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        output::print_changed(action, changed);
    }
    Ok(())
}

pub async fn pause(client: &OverseerClient, reason: Option<&str>, json_mode: bool) -> Result<()> {
    let changed = client.pause(reason).await?;
    report("pause", changed, json_mode)
}

pub async fn resume(client: &OverseerClient, json_mode: bool) -> Result<()> {
    let changed = client.resume().await?;
    report("resume", changed, json_mode)
}

pub async fn stop(client: &OverseerClient, json_mode: bool) -> Result<()> {
    let changed = client.stop().await?;
    report("stop", changed, json_mode)
}
