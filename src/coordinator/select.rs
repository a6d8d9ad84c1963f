//! Upstream selection policy.
//!
//! A candidate qualifies when it has validated internet access and, unless
//! metered networks are allowed, is unmetered. Among qualifying candidates
//! the configured kind preference wins; equal ranks go to the most recently
//! added network.

use crate::config::Config;
use crate::upstream::UpstreamInfo;

pub(crate) fn qualifies(candidate: &UpstreamInfo, config: &Config) -> bool {
    let caps = candidate.capabilities;
    caps.internet && caps.validated && (config.allow_metered || !caps.metered)
}

pub(crate) fn select_upstream(candidates: &[UpstreamInfo], config: &Config) -> Option<UpstreamInfo> {
    candidates
        .iter()
        .filter(|c| qualifies(c, config))
        .min_by_key(|c| (config.preference_rank(c.kind), std::cmp::Reverse(c.sequence)))
        .cloned()
}
