// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the convoy CLI

pub mod config;
pub mod daemon;

pub use self::config::ConfigCommand;
pub use self::daemon::DaemonCommand;
