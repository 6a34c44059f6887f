// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::node::WorkerNode;

/// How a node is picked among the available candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// Candidate at `task_count % candidates`.
    RoundRobin,
    /// Most spare capacity; ties go to the earliest candidate.
    #[default]
    LeastLoaded,
    Random,
    /// Candidates are already capability-filtered, so this is least-loaded.
    CapabilityMatch,
}

impl LoadBalanceStrategy {
    pub fn select<'a>(
        &self,
        candidates: &'a [WorkerNode],
        task_count: usize,
    ) -> Option<&'a WorkerNode> {
        if candidates.is_empty() {
            return None;
        }
        match self {
            LoadBalanceStrategy::RoundRobin => candidates.get(task_count % candidates.len()),
            LoadBalanceStrategy::LeastLoaded | LoadBalanceStrategy::CapabilityMatch => candidates
                .iter()
                .fold(None, |best: Option<&WorkerNode>, node| match best {
                    Some(b) if b.available_capacity() >= node.available_capacity() => Some(b),
                    _ => Some(node),
                }),
            LoadBalanceStrategy::Random => candidates.choose(&mut rand::rng()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceStrategy::RoundRobin => "round_robin",
            LoadBalanceStrategy::LeastLoaded => "least_loaded",
            LoadBalanceStrategy::Random => "random",
            LoadBalanceStrategy::CapabilityMatch => "capability_match",
        }
    }
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown load balance strategy: {0}")]
pub struct UnknownStrategy(pub String);

impl FromStr for LoadBalanceStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(LoadBalanceStrategy::RoundRobin),
            "least_loaded" => Ok(LoadBalanceStrategy::LeastLoaded),
            "random" => Ok(LoadBalanceStrategy::Random),
            "capability_match" => Ok(LoadBalanceStrategy::CapabilityMatch),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}
