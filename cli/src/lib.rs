// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! convoy CLI library - exposes testable components
//!
//! # Architecture
//!
//! - **Layer:** Interface / Presentation Layer
//! - **Purpose:** configuration manifest, CLI command handlers and the daemon
//!   (service wiring plus the HTTP worker API)

pub mod commands;
pub mod config;
pub mod daemon;
