// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent types every daemon ships with. Deployments add their own through
//! [`AgentTypeRegistry::register`].

use convoy_core::domain::agent::{
    agent_fn, AgentContext, AgentError, AgentResult, AgentTypeRegistry,
};
use serde_json::json;
use std::time::Duration;

pub const ECHO: &str = "echo";
pub const DELAY: &str = "delay";

const DEFAULT_DELAY_MS: u64 = 1000;

/// Registry holding the built-in `echo` and `delay` agents.
pub fn builtin_registry() -> AgentTypeRegistry {
    let registry = AgentTypeRegistry::new();

    registry.register(
        ECHO,
        agent_fn(|ctx: AgentContext| async move {
            Ok(AgentResult::success(json!({
                "goal": ctx.goal,
                "params": ctx.params,
            }))
            .with_iterations(1))
        }),
    );

    // Waits `duration_ms` (honouring pause and cancel), or fails when asked to.
    registry.register(
        DELAY,
        agent_fn(|mut ctx: AgentContext| async move {
            let millis = ctx.params["duration_ms"]
                .as_u64()
                .unwrap_or(DEFAULT_DELAY_MS);
            ctx.wait_if_paused().await;

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(millis)) => {}
                _ = ctx.cancelled() => return Err(AgentError::Cancelled),
            }

            if let Some(reason) = ctx.params["fail"].as_str() {
                return Err(AgentError::Failed(reason.to_string()));
            }
            Ok(AgentResult::success(json!({ "slept_ms": millis })).with_iterations(1))
        }),
    );

    registry
}
