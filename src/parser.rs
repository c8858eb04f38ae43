//! Log line parsing for sshd password authentication.
//!
//! The pattern is deliberately the only thing here; the rest of the daemon
//! consumes structured [`AuthEvent`]s, so supporting another service means
//! writing another parser, not touching the core.

use regex::Regex;

use crate::event::{AuthEvent, Outcome, Timestamp};

/// Recognizes sshd password-authentication results, e.g.
///
/// ```text
/// Failed password for invalid user admin from 203.0.113.7 port 22 ssh2
/// Accepted password for alice from 10.0.0.5 port 50022 ssh2
/// ```
pub struct SshdParser {
    pattern: Regex,
}

impl SshdParser {
    pub fn new() -> Self {
        let pattern = Regex::new(r"(Accepted|Failed) password for (?:invalid user )?\S+ from (\S+)")
            .expect("hard-coded pattern compiles");
        Self { pattern }
    }

    /// Extract an event from one raw line. Non-matching lines yield `None`
    /// and are dropped silently by the caller.
    pub fn parse(&self, line: &str, now: Timestamp) -> Option<AuthEvent> {
        let captures = self.pattern.captures(line)?;
        let outcome = match captures.get(1)?.as_str() {
            "Accepted" => Outcome::Success,
            _ => Outcome::Failure,
        };
        let address = captures.get(2)?.as_str().to_string();
        Some(AuthEvent { address, outcome, timestamp: now })
    }
}

impl Default for SshdParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_failed_password() {
        let parser = SshdParser::new();
        let event = parser
            .parse("Failed password for root from 203.0.113.7 port 39456 ssh2", 100)
            .expect("line matches");
        assert_eq!(event.address, "203.0.113.7");
        assert_eq!(event.outcome, Outcome::Failure);
        assert_eq!(event.timestamp, 100);
    }

    #[test]
    fn parses_invalid_user_variant() {
        let parser = SshdParser::new();
        let event = parser
            .parse("Failed password for invalid user admin from 198.51.100.2 port 2201 ssh2", 5)
            .expect("line matches");
        assert_eq!(event.address, "198.51.100.2");
        assert_eq!(event.outcome, Outcome::Failure);
    }

    #[test]
    fn parses_accepted_password() {
        let parser = SshdParser::new();
        let event = parser
            .parse("Accepted password for alice from 10.0.0.5 port 50022 ssh2", 7)
            .expect("line matches");
        assert_eq!(event.address, "10.0.0.5");
        assert_eq!(event.outcome, Outcome::Success);
    }

    #[test]
    fn ignores_unrelated_lines() {
        let parser = SshdParser::new();
        assert!(parser.parse("Connection closed by 10.0.0.5 port 22", 0).is_none());
        assert!(parser.parse("pam_unix(sshd:session): session opened", 0).is_none());
        assert!(parser.parse("", 0).is_none());
    }
}
