// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod message_bus;
pub mod patterns;
pub mod session_binding;
pub mod session_machine;
pub mod supervisor;

pub use message_bus::{BridgeConfig, BusConfig, BusError, MessageBus, SubscribeOptions};
pub use patterns::{AgentCoordinator, AgentJob, PipelineStage};
pub use session_binding::bind_sessions;
pub use session_machine::{NewSession, SessionError, SessionMachine};
pub use supervisor::{Orchestrator, OrchestratorConfig, OrchestratorError, SupervisionStrategy};
