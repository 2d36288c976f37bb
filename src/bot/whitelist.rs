//! Channel whitelist gating

use crate::error::{Error, Result};
use regex::Regex;

/// Optional gate on inbound events by channel id pattern.
///
/// Patterns are compiled at construction; an invalid pattern fails
/// construction. An empty whitelist allows every channel.
#[derive(Debug)]
pub struct ChannelWhitelist {
    patterns: Vec<Regex>,
}

impl ChannelWhitelist {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    Error::Config(format!("invalid whitelist pattern '{}': {}", pattern, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { patterns })
    }

    /// True when the list is empty or any pattern matches.
    pub fn is_allowed(&self, channel_id: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.is_match(channel_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_whitelist_allows_all() {
        let whitelist = ChannelWhitelist::new(&[]).unwrap();
        assert!(whitelist.is_allowed("C123"));
        assert!(whitelist.is_allowed(""));
    }

    #[test]
    fn test_matching_patterns() {
        let whitelist =
            ChannelWhitelist::new(&["^C.*DEV$".to_string(), "^D".to_string()]).unwrap();
        assert!(whitelist.is_allowed("C123DEV"));
        assert!(whitelist.is_allowed("D999"));
        assert!(!whitelist.is_allowed("C123PROD"));
    }

    #[test]
    fn test_invalid_pattern_fails_construction() {
        let err = ChannelWhitelist::new(&["[unclosed".to_string()]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_is_allowed_is_pure() {
        let whitelist = ChannelWhitelist::new(&["^C.*DEV$".to_string()]).unwrap();
        for _ in 0..3 {
            assert!(whitelist.is_allowed("CXDEV"));
            assert!(!whitelist.is_allowed("CXPROD"));
        }
    }
}
