//! MQTT-style topic filters with `+` (one level) and `#` (remaining levels).

use super::errors::BrokerError;

/// Validated subscription filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    raw: String,
}

impl TopicFilter {
    /// Parse a filter; wildcards must occupy a whole level and `#` must be last.
    pub fn parse(filter: &str) -> Result<Self, BrokerError> {
        if filter.is_empty() {
            return Err(BrokerError::Protocol("empty topic filter".into()));
        }
        let levels: Vec<&str> = filter.split('/').collect();
        for (i, level) in levels.iter().enumerate() {
            let wildcard = level.contains('+') || level.contains('#');
            if wildcard && level.len() != 1 {
                return Err(BrokerError::Protocol(format!(
                    "wildcard must occupy a whole level in '{filter}'"
                )));
            }
            if *level == "#" && i + 1 != levels.len() {
                return Err(BrokerError::Protocol(format!(
                    "'#' must be the last level in '{filter}'"
                )));
            }
        }
        Ok(Self {
            raw: filter.to_string(),
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn has_wildcards(&self) -> bool {
        self.raw.contains(['+', '#'])
    }

    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        let mut filter = self.raw.split('/');
        let mut levels = topic.split('/');
        loop {
            match (filter.next(), levels.next()) {
                (Some("#"), _) => return true,
                (Some("+"), Some(_)) => {}
                (Some(f), Some(t)) if f == t => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(s: &str) -> TopicFilter {
        TopicFilter::parse(s).unwrap()
    }

    #[test]
    fn test_exact_match() {
        assert!(filter("sensor/readings").matches("sensor/readings"));
        assert!(!filter("sensor/readings").matches("sensor/readings/raw"));
        assert!(!filter("sensor/readings").has_wildcards());
    }

    #[test]
    fn test_single_level_wildcard() {
        let f = filter("site/+/temperature");
        assert!(f.matches("site/a/temperature"));
        assert!(!f.matches("site/a/b/temperature"));
        assert!(!f.matches("site/temperature"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        let f = filter("site/#");
        assert!(f.matches("site/a"));
        assert!(f.matches("site/a/b/c"));
        assert!(f.matches("site"));
        assert!(!f.matches("other/a"));
        assert!(filter("#").matches("anything/at/all"));
    }

    #[test]
    fn test_invalid_filters() {
        assert!(TopicFilter::parse("").is_err());
        assert!(TopicFilter::parse("site/#/x").is_err());
        assert!(TopicFilter::parse("site/a+").is_err());
        assert!(TopicFilter::parse("site/#x").is_err());
    }
}
