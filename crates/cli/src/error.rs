use colored::Colorize;

/// What the operator can do about a failed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hint {
    /// Nothing answered at the configured endpoint.
    Unreachable,
    /// The endpoint answered too slowly.
    TimedOut,
    /// A live revert was refused because destructive actions are disarmed.
    DestructiveBlocked,
    /// The loop refused the request while safe-paused.
    SafePaused,
}

impl Hint {
    /// Process exit code for this class of failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Unreachable | Self::TimedOut => 2,
            Self::DestructiveBlocked | Self::SafePaused => 3,
        }
    }
}

/// Classifies an error chain by its rendered text. reqwest does not expose
/// a stable kind for every transport failure.
pub fn classify(err: &anyhow::Error) -> Option<Hint> {
    let msg = format!("{err:#}");
    if msg.contains("Connection refused")
        || msg.contains("tcp connect error")
        || msg.contains("dns error")
    {
        Some(Hint::Unreachable)
    } else if msg.contains("operation timed out") || msg.contains("timed out") {
        Some(Hint::TimedOut)
    } else if msg.contains("requires operator approval") || msg.contains("Destructive action blocked") {
        Some(Hint::DestructiveBlocked)
    } else if msg.contains("safe-pause") || msg.contains("safe_pause") {
        Some(Hint::SafePaused)
    } else if msg.contains("error sending request") {
        Some(Hint::Unreachable)
    } else {
        None
    }
}

/// Prints the error with operator guidance and returns the exit code.
pub fn display_error(err: &anyhow::Error, endpoint: &str) -> i32 {
    let hint = classify(err);
    match &hint {
        Some(Hint::Unreachable) => {
            eprintln!("  {} No overseer control API at {}", "ERROR".red().bold(), endpoint);
            eprintln!(
                "        Start the loop with its API enabled: {}",
                "overseer run".dimmed()
            );
            eprintln!(
                "        Or point the CLI elsewhere: {}",
                "overseerctl config set url http://HOST:PORT".dimmed()
            );
        }
        Some(Hint::TimedOut) => {
            eprintln!("  {} {} did not answer in time", "ERROR".red().bold(), endpoint);
            eprintln!(
                "        The loop may be stuck mid-generation; check {} for its heartbeat",
                "heartbeat.json".dimmed()
            );
            eprintln!(
                "        Or allow more time: {}",
                "overseerctl config set timeout_secs 30".dimmed()
            );
        }
        Some(Hint::DestructiveBlocked) => {
            eprintln!("  {} {}", "BLOCKED".yellow().bold(), err);
            eprintln!(
                "        Live reverts need {} on the loop host",
                "OVERSEER_ALLOW_DESTRUCTIVE_ACTIONS=true".dimmed()
            );
        }
        Some(Hint::SafePaused) => {
            eprintln!("  {} {}", "PAUSED".yellow().bold(), err);
            eprintln!(
                "        Inspect the cause with {} then clear it with {}",
                "overseerctl status".dimmed(),
                "overseerctl resume".dimmed()
            );
        }
        None => {
            eprintln!("  {} {}", "ERROR".red().bold(), err);
            for cause in err.chain().skip(1) {
                eprintln!("        {} {cause}", "caused by:".dimmed());
            }
        }
    }
    hint.map_or(1, |h| h.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_refused_connection_is_unreachable() {
        let err = anyhow!("tcp connect error: Connection refused (os error 111)")
            .context("Failed to connect to overseer control API");
        assert_eq!(classify(&err), Some(Hint::Unreachable));
        assert_eq!(Hint::Unreachable.exit_code(), 2);
    }

    #[test]
    fn test_timeout_is_not_reported_as_unreachable() {
        let err = anyhow!("error sending request: operation timed out");
        assert_eq!(classify(&err), Some(Hint::TimedOut));
    }

    #[test]
    fn test_blocked_revert_points_at_arming_switch() {
        let err = anyhow!(
            "409 Conflict: Destructive action blocked: destructive action requires operator approval"
        );
        assert_eq!(classify(&err), Some(Hint::DestructiveBlocked));
        assert_eq!(Hint::DestructiveBlocked.exit_code(), 3);
    }

    #[test]
    fn test_other_errors_have_no_hint() {
        let err = anyhow!("400 Bad Request: reason too long");
        assert_eq!(classify(&err), None);
    }
}
