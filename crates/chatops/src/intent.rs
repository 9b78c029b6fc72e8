//! Fixed-set intent parsing for conversation messages.

/// What a user asked for in a chat message or slash command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Status,
    Logs,
    Deployments,
    Restart,
    Redeploy,
    Stop,
    ScaleMemory(u32),
    ScaleReplicas(u32),
    Rollback,
    Help,
    Resolve,
    Unknown,
}

impl Intent {
    /// Whether this intent mutates platform state.
    #[must_use]
    pub const fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::Restart
                | Self::Redeploy
                | Self::Stop
                | Self::ScaleMemory(_)
                | Self::ScaleReplicas(_)
                | Self::Rollback
        )
    }
}

/// Classify free text into the fixed intent set.
///
/// Matching is keyword-based and first-match-wins over the mutating
/// intents, so "please restart the service" parses the same as "restart".
#[must_use]
pub fn parse_intent(text: &str) -> Intent {
    let normalized = text.trim().to_lowercase();
    if normalized.is_empty() {
        return Intent::Unknown;
    }

    if let Some(rest) = keyword_suffix(&normalized, "scale memory") {
        return match parse_number(rest) {
            Some(mb) => Intent::ScaleMemory(mb),
            None => Intent::Help,
        };
    }
    if let Some(rest) = keyword_suffix(&normalized, "scale replicas") {
        return match parse_number(rest) {
            Some(n) => Intent::ScaleReplicas(n),
            None => Intent::Help,
        };
    }

    if normalized.contains("redeploy") {
        return Intent::Redeploy;
    }
    if normalized.contains("restart") {
        return Intent::Restart;
    }
    if normalized.contains("rollback") || normalized.contains("roll back") {
        return Intent::Rollback;
    }
    if word(&normalized, "stop") {
        return Intent::Stop;
    }
    if normalized.contains("resolve") || normalized.contains("resolved") {
        return Intent::Resolve;
    }
    if word(&normalized, "status") || normalized.contains("what's happening") {
        return Intent::Status;
    }
    if word(&normalized, "logs") || word(&normalized, "log") {
        return Intent::Logs;
    }
    if normalized.contains("deployment") {
        return Intent::Deployments;
    }
    if word(&normalized, "help") || normalized.starts_with('?') {
        return Intent::Help;
    }

    Intent::Unknown
}

fn keyword_suffix<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    text.find(keyword).map(|idx| &text[idx + keyword.len()..])
}

fn parse_number(rest: &str) -> Option<u32> {
    rest.split_whitespace()
        .next()
        .and_then(|token| token.trim_end_matches(|c: char| !c.is_ascii_digit()).parse().ok())
}

fn word(text: &str, needle: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .any(|token| token == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_intents() {
        assert_eq!(parse_intent("status"), Intent::Status);
        assert_eq!(parse_intent("show me the logs"), Intent::Logs);
        assert_eq!(parse_intent("recent deployments?"), Intent::Deployments);
        assert_eq!(parse_intent("help"), Intent::Help);
    }

    #[test]
    fn mutating_intents() {
        assert_eq!(parse_intent("please restart the service"), Intent::Restart);
        assert_eq!(parse_intent("redeploy"), Intent::Redeploy);
        assert_eq!(parse_intent("stop it"), Intent::Stop);
        assert_eq!(parse_intent("roll back to the last good build"), Intent::Rollback);
        assert!(parse_intent("restart").is_mutating());
        assert!(!parse_intent("status").is_mutating());
    }

    #[test]
    fn scale_intents_carry_amounts() {
        assert_eq!(parse_intent("scale memory 1024"), Intent::ScaleMemory(1024));
        assert_eq!(parse_intent("scale memory 512mb"), Intent::ScaleMemory(512));
        assert_eq!(parse_intent("scale replicas 3"), Intent::ScaleReplicas(3));
    }

    #[test]
    fn scale_without_amount_asks_for_help() {
        assert_eq!(parse_intent("scale memory"), Intent::Help);
        assert_eq!(parse_intent("scale replicas lots"), Intent::Help);
    }

    #[test]
    fn unknown_and_empty() {
        assert_eq!(parse_intent("tell me a joke"), Intent::Unknown);
        assert_eq!(parse_intent("   "), Intent::Unknown);
    }

    #[test]
    fn resolve_closes() {
        assert_eq!(parse_intent("mark this resolved"), Intent::Resolve);
    }
}
