/// Manual commands the operator can send to the agent from chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCommand {
    /// Current exposure, counters and halt state.
    Status,
    /// Market-close a specific trade.
    CloseTrade(i64),
    /// Cancel resting orders on an instrument.
    CancelOrders(String),
    /// Clear the kill-switch halt after manual review.
    ResetKillSwitch,
}

/// Parse a chat message into a command. Anything unrecognized is None;
/// regular conversation in the channel is not an error.
pub fn parse_command(text: &str) -> Option<AgentCommand> {
    let mut parts = text.trim().split_whitespace();
    let head = parts.next()?;
    // Strip the @botname suffix Telegram appends in groups
    let head = head.split('@').next()?;

    match head {
        "/status" => Some(AgentCommand::Status),
        "/close" => parts.next()?.parse().ok().map(AgentCommand::CloseTrade),
        "/cancel_orders" => Some(AgentCommand::CancelOrders(
            parts.next()?.to_uppercase(),
        )),
        "/reset_killswitch" => Some(AgentCommand::ResetKillSwitch),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands() {
        assert_eq!(parse_command("/status"), Some(AgentCommand::Status));
        assert_eq!(
            parse_command("/close 42"),
            Some(AgentCommand::CloseTrade(42))
        );
        assert_eq!(
            parse_command("/cancel_orders btcusdt"),
            Some(AgentCommand::CancelOrders("BTCUSDT".to_string()))
        );
        assert_eq!(
            parse_command("/reset_killswitch"),
            Some(AgentCommand::ResetKillSwitch)
        );
    }

    #[test]
    fn strips_bot_mention() {
        assert_eq!(
            parse_command("/status@signal_agent_bot"),
            Some(AgentCommand::Status)
        );
    }

    #[test]
    fn chatter_is_not_a_command() {
        assert_eq!(parse_command("nice call on btc"), None);
        assert_eq!(parse_command("/close notanumber"), None);
        assert_eq!(parse_command(""), None);
    }
}
