// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-subscriber topic filtering.

use serde::{Deserialize, Serialize};

/// A topic filter: a set of event-name patterns.
///
/// An empty filter matches everything. A pattern ending in `*` matches by
/// prefix (`on_playtest_*`); anything else matches exactly.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicFilter {
    patterns: Vec<String>,
}

impl TopicFilter {
    /// Match-all filter.
    pub fn all() -> Self {
        Self::default()
    }

    /// Build from explicit patterns.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a comma-separated list, as used in `?topics=a,b`.
    ///
    /// Blank segments are dropped; a blank or missing list matches all.
    pub fn parse(spec: &str) -> Self {
        Self::new(
            spec.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        )
    }

    /// Whether `event` passes this filter.
    pub fn matches(&self, event: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        self.patterns.iter().any(|p| match p.strip_suffix('*') {
            Some(prefix) => event.starts_with(prefix),
            None => p == event,
        })
    }

    /// The raw patterns.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_matches_everything() {
        let f = TopicFilter::all();
        assert!(f.matches("on_asset_registered"));
        assert!(f.matches("anything"));
    }

    #[test]
    fn exact_match() {
        let f = TopicFilter::new(["on_job_state_changed"]);
        assert!(f.matches("on_job_state_changed"));
        assert!(!f.matches("on_job_state"));
        assert!(!f.matches("on_asset_registered"));
    }

    #[test]
    fn prefix_wildcard() {
        let f = TopicFilter::new(["on_playtest_*"]);
        assert!(f.matches("on_playtest_start"));
        assert!(f.matches("on_playtest_step"));
        assert!(!f.matches("on_scene_enter"));
    }

    #[test]
    fn parse_handles_blanks() {
        let f = TopicFilter::parse(" on_scene_enter , ,on_playtest_* ");
        assert!(f.matches("on_scene_enter"));
        assert!(f.matches("on_playtest_finished"));
        assert!(!f.matches("on_asset_removed"));

        assert!(TopicFilter::parse("").matches("anything"));
    }
}
