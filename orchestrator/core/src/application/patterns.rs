// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Multi-agent coordination patterns built on the [`Orchestrator`].
//!
//! Every pattern registers transient agents with `RestartPolicy::Never` and
//! unregisters them once their result has been collected.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::application::supervisor::{Orchestrator, OrchestratorError};
use crate::domain::agent::{AgentFactory, AgentId, AgentResult, AgentSpec, RestartPolicy};

/// One agent invocation inside a pattern.
#[derive(Clone)]
pub struct AgentJob {
    pub agent_type: String,
    pub factory: Arc<dyn AgentFactory>,
    pub goal: String,
    pub params: serde_json::Value,
}

impl AgentJob {
    pub fn new(
        agent_type: impl Into<String>,
        factory: Arc<dyn AgentFactory>,
        goal: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            agent_type: agent_type.into(),
            factory,
            goal: goal.into(),
            params,
        }
    }
}

/// A pipeline stage. `{input}` in the goal template is replaced with the
/// previous stage's output.
#[derive(Clone)]
pub struct PipelineStage {
    pub agent_type: String,
    pub factory: Arc<dyn AgentFactory>,
    pub goal_template: String,
}

impl PipelineStage {
    pub fn new(
        agent_type: impl Into<String>,
        factory: Arc<dyn AgentFactory>,
        goal_template: impl Into<String>,
    ) -> Self {
        Self {
            agent_type: agent_type.into(),
            factory,
            goal_template: goal_template.into(),
        }
    }
}

pub struct AgentCoordinator {
    orchestrator: Orchestrator,
}

impl AgentCoordinator {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// Run all jobs concurrently. Results come back in input order; a job that
    /// exceeds `timeout` is stopped and reported as timed out.
    pub async fn run_parallel(
        &self,
        jobs: Vec<AgentJob>,
        timeout: Option<Duration>,
    ) -> Result<Vec<AgentResult>, OrchestratorError> {
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            let id = self.launch(job.agent_type, job.factory, &job.goal, job.params).await?;
            ids.push(id);
        }
        info!(agents = ids.len(), "Running agents in parallel");

        let results = join_all(ids.iter().map(|id| self.collect(id, timeout))).await;
        Ok(results)
    }

    /// Run stages one after another, feeding each stage's output to the next.
    /// Stops at the first unsuccessful stage and returns its result.
    pub async fn run_pipeline(
        &self,
        stages: Vec<PipelineStage>,
        initial_input: serde_json::Value,
    ) -> Result<Option<AgentResult>, OrchestratorError> {
        let mut input = initial_input;
        let mut last = None;

        for (index, stage) in stages.into_iter().enumerate() {
            let goal = stage.goal_template.replace("{input}", &render(&input));
            let params = serde_json::json!({ "input": input });
            let id = self.launch(stage.agent_type, stage.factory, &goal, params).await?;
            let result = self.collect(&id, None).await;

            debug!(stage = index, success = result.success, "Pipeline stage finished");
            if !result.success {
                warn!(stage = index, error = ?result.error, "Pipeline aborted");
                return Ok(Some(result));
            }
            input = result.output.clone();
            last = Some(result);
        }

        Ok(last)
    }

    /// Map every item in parallel (`{item}` in the template), then hand the
    /// successful outputs to a single reduce agent as `{"inputs": [...]}`.
    pub async fn run_map_reduce(
        &self,
        map: (&str, Arc<dyn AgentFactory>),
        reduce: (&str, Arc<dyn AgentFactory>),
        items: Vec<serde_json::Value>,
        map_goal_template: &str,
        reduce_goal: &str,
    ) -> Result<AgentResult, OrchestratorError> {
        let (map_type, map_factory) = map;
        let jobs = items
            .into_iter()
            .map(|item| {
                AgentJob::new(
                    map_type,
                    map_factory.clone(),
                    map_goal_template.replace("{item}", &render(&item)),
                    serde_json::json!({ "item": item }),
                )
            })
            .collect();

        let outputs: Vec<serde_json::Value> = self
            .run_parallel(jobs, None)
            .await?
            .into_iter()
            .filter(|r| r.success)
            .map(|r| r.output)
            .collect();
        info!(mapped = outputs.len(), "Map phase finished, reducing");

        let (reduce_type, reduce_factory) = reduce;
        let id = self
            .launch(
                reduce_type.to_string(),
                reduce_factory,
                reduce_goal,
                serde_json::json!({ "inputs": outputs }),
            )
            .await?;
        Ok(self.collect(&id, None).await)
    }

    async fn launch(
        &self,
        agent_type: String,
        factory: Arc<dyn AgentFactory>,
        goal: &str,
        params: serde_json::Value,
    ) -> Result<AgentId, OrchestratorError> {
        let spec = AgentSpec::new(agent_type, factory).with_restart_policy(RestartPolicy::Never);
        let id = self.orchestrator.register(spec).await?;
        if let Err(e) = self.orchestrator.start(&id, goal, params).await {
            self.orchestrator.unregister(&id).await;
            return Err(e);
        }
        Ok(id)
    }

    /// Wait for the agent, turn its final state into a result and unregister it.
    async fn collect(&self, id: &AgentId, timeout: Option<Duration>) -> AgentResult {
        let waited = match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.orchestrator.wait(id)).await {
                Ok(state) => state.ok(),
                Err(_) => {
                    warn!(agent_id = %id, ?limit, "Agent exceeded pattern timeout, stopping");
                    if let Err(e) = self.orchestrator.stop(id, false).await {
                        debug!(agent_id = %id, error = %e, "Stop after pattern timeout failed");
                    }
                    self.orchestrator.unregister(id).await;
                    return AgentResult::timeout(limit);
                }
            },
            None => self.orchestrator.wait(id).await.ok(),
        };
        self.orchestrator.unregister(id).await;

        match waited {
            Some(state) => match state.result {
                Some(result) => result,
                None => AgentResult::failure(
                    state
                        .last_error
                        .unwrap_or_else(|| format!("agent ended as {}", state.status)),
                ),
            },
            None => AgentResult::failure(format!("agent {id} disappeared before completing")),
        }
    }
}

/// Strings are substituted verbatim, anything else as compact JSON.
fn render(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::message_bus::MessageBus;
    use crate::application::supervisor::OrchestratorConfig;
    use crate::domain::agent::{agent_fn, AgentContext, AgentError};
    use serde_json::json;

    fn coordinator() -> (AgentCoordinator, Orchestrator) {
        let orch = Orchestrator::new(OrchestratorConfig::default(), MessageBus::default());
        (AgentCoordinator::new(orch.clone()), orch)
    }

    fn upper() -> Arc<dyn AgentFactory> {
        agent_fn(|ctx: AgentContext| async move {
            Ok(AgentResult::success(json!(ctx.goal.to_uppercase())))
        })
    }

    #[tokio::test]
    async fn test_parallel_results_keep_input_order() {
        let (coord, orch) = coordinator();
        let jobs = vec![
            AgentJob::new("upper", upper(), "a", json!({})),
            AgentJob::new("upper", upper(), "b", json!({})),
            AgentJob::new("upper", upper(), "c", json!({})),
        ];

        let results = coord.run_parallel(jobs, None).await.unwrap();
        let outputs: Vec<_> = results.iter().map(|r| r.output.clone()).collect();
        assert_eq!(outputs, vec![json!("A"), json!("B"), json!("C")]);
        assert!(orch.list(None).is_empty());
    }

    #[tokio::test]
    async fn test_parallel_timeout_stops_slow_agent() {
        let (coord, orch) = coordinator();
        let slow = agent_fn(|ctx: AgentContext| async move {
            ctx.cancelled().await;
            Err(AgentError::Cancelled)
        });
        let jobs = vec![
            AgentJob::new("upper", upper(), "fast", json!({})),
            AgentJob::new("slow", slow, "slow", json!({})),
        ];

        let results = coord
            .run_parallel(jobs, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(results[0].success);
        assert!(results[1].timed_out);
        assert!(orch.list(None).is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_threads_output_through_stages() {
        let (coord, _orch) = coordinator();
        let exclaim = agent_fn(|ctx: AgentContext| async move {
            Ok(AgentResult::success(json!(format!(
                "{}!",
                ctx.params["input"].as_str().unwrap_or_default()
            ))))
        });
        let stages = vec![
            PipelineStage::new("upper", upper(), "{input}"),
            PipelineStage::new("exclaim", exclaim, "shout {input}"),
        ];

        let result = coord
            .run_pipeline(stages, json!("hello"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.output, json!("HELLO!"));
    }

    #[tokio::test]
    async fn test_pipeline_stops_at_failed_stage() {
        let (coord, _orch) = coordinator();
        let broken = agent_fn(|_ctx: AgentContext| async move {
            Err(AgentError::Failed("stage broke".to_string()))
        });
        let stages = vec![
            PipelineStage::new("broken", broken, "{input}"),
            PipelineStage::new("upper", upper(), "{input}"),
        ];

        let result = coord
            .run_pipeline(stages, json!("x"))
            .await
            .unwrap()
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Agent failed: stage broke"));
    }

    #[tokio::test]
    async fn test_map_reduce_sums_successful_outputs() {
        let (coord, _orch) = coordinator();
        let double = agent_fn(|ctx: AgentContext| async move {
            match ctx.params["item"].as_i64() {
                Some(n) => Ok(AgentResult::success(json!(n * 2))),
                None => Err(AgentError::Failed("not a number".to_string())),
            }
        });
        let sum = agent_fn(|ctx: AgentContext| async move {
            let total: i64 = ctx.params["inputs"]
                .as_array()
                .map(|v| v.iter().filter_map(|x| x.as_i64()).sum())
                .unwrap_or_default();
            Ok(AgentResult::success(json!(total)))
        });

        let result = coord
            .run_map_reduce(
                ("double", double),
                ("sum", sum),
                vec![json!(1), json!(2), json!("skip"), json!(3)],
                "double {item}",
                "sum everything",
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output, json!(12));
    }
}
