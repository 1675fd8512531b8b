use dh_core::cooldown::WatchStatus;
use dh_core::config::Config;
use dh_core::types::CliType;

use super::open_cooldowns;

/// Print the availability of every agent CLI.
pub fn status(cfg: &Config, json: bool) -> anyhow::Result<()> {
    let tracker = open_cooldowns(cfg)?;
    let states: Vec<_> = CliType::ALL.iter().map(|cli| tracker.state(*cli)).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&states)?);
        return Ok(());
    }

    for state in &states {
        let line = match state.status {
            WatchStatus::OnCooldown if tracker.is_on_cooldown(state.cli) => format!(
                "cooling down, {:.0}s left",
                tracker.seconds_remaining(state.cli)
            ),
            WatchStatus::Unavailable => "unavailable".to_string(),
            _ => "ready".to_string(),
        };
        match &state.reason {
            Some(reason) if state.status != WatchStatus::Ready => {
                println!("{:<10} {line}  ({reason})", state.cli.as_str())
            }
            _ => println!("{:<10} {line}", state.cli.as_str()),
        }
    }
    Ok(())
}

/// Clear one CLI's cooldown.
pub fn clear(cfg: &Config, cli: CliType) -> anyhow::Result<()> {
    let tracker = open_cooldowns(cfg)?;
    tracker.clear(cli)?;
    println!("{cli} cleared");
    Ok(())
}
