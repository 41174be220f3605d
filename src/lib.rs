//! # Spiral Orchestrator
//!
//! An autonomous development orchestrator: it drives a coding-agent CLI
//! through phase-gated engineering cycles (research, design, implement,
//! test), coordinating task selection, claim arbitration across a fleet
//! of concurrent sessions, context-window budgeting and fleet-wide rate
//! limiting, and exposes the whole state over an HTTP/SSE/WebSocket
//! control plane.
//!
//! ## Architecture
//!
//! - **Task store** (`tasks`): the JSON-backed backlog, scoring and
//!   dependency graph.
//! - **Session registry** (`session`): live agent sessions, dedup and
//!   delegation hierarchy.
//! - **Claim coordinator** (`claims`): TTL-based exclusive task claims,
//!   backed by SQLite.
//! - **Context tracker** (`context_tracker`): transcript usage accounting
//!   and threshold alerts.
//! - **Rate-limit tracker** (`rate_limit`): fleet-wide message pacing
//!   across 5-hour, daily and weekly windows.
//! - **Orchestrator** (`orchestrator`): the outer loop tying the above
//!   together and supervising the agent subprocess.
//! - **Control plane** (`api`): the HTTP surface, SSE and WebSocket feeds.

/// Control-plane HTTP, SSE and WebSocket API.
pub mod api;
/// Authentication and authorization middleware.
pub mod auth;
/// Claim coordinator (C4).
pub mod claims;
/// System configuration.
pub mod config;
/// System-wide constants.
pub mod constants;
/// Context/usage tracker (C5).
pub mod context_tracker;
/// Error types and handling.
pub mod error;
/// Typed event bus.
pub mod events;
/// HTTP-layer request rate limiting.
pub mod http_rate_limit;
/// Core data models.
pub mod models;
/// System monitoring and metrics.
pub mod monitoring;
/// Orchestrator outer loop, subprocess supervision and prompt building.
pub mod orchestrator;
/// Phase quality gate and scoring rubric.
pub mod quality_gate;
/// Fleet-wide rate-limit tracker (C6).
pub mod rate_limit;
/// Session registry (C3).
pub mod session;
/// Task store (C2).
pub mod tasks;
/// Input validation and sanitization.
pub mod validation;

pub use error::{AppError, Result};
pub use events::EventBus;
