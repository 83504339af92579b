//! Hierarchical task orchestration for Pilott agents.
//!
//! The [`Orchestrator`] accepts tasks, validates them, routes each one to the
//! best-suited agent in its [`AgentPool`] and returns a final result. Optional
//! background loops keep the pool healthy: the [`DynamicScaler`] sizes it to
//! the load, the [`LoadBalancer`] moves work off overloaded agents and the
//! [`FaultMonitor`] restarts or retires agents that fail health checks.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Lifecycle, submission and status.
//! - [`TaskRouter`] — Weighted agent selection over pool snapshots.
//! - [`AgentPool`] — Bounded set of running agents.
//! - [`Dispatcher`] — Admission, routing, waiting and redelivery per task.
//! - [`OrchestratorConfig`] — TOML-backed configuration.

/// Work redistribution between agents.
pub mod balancer;
/// Orchestrator configuration.
pub mod config;
/// Per-task admission, routing and redelivery.
pub mod dispatch;
/// Orchestrator lifecycle and public API.
pub mod engine;
/// Health checks and agent recovery.
pub mod fault;
/// Orchestrator-wide counters.
pub mod metrics;
/// The agent pool.
pub mod pool;
/// Waiting lines for busy agents.
pub mod reservation;
/// Agent selection.
pub mod router;
/// Dynamic pool sizing.
pub mod scaler;
/// Registry of submitted tasks.
pub mod tracker;
/// Task shape checks.
pub mod validation;

pub use balancer::{LoadBalancer, LoadBalancingConfig, RebalanceReport, Reroute};
pub use config::OrchestratorConfig;
pub use dispatch::{DispatchLimits, Dispatcher};
pub use engine::Orchestrator;
pub use fault::{FaultMonitor, FaultToleranceConfig, HealthAction};
pub use metrics::{MetricsSnapshot, OrchestratorMetrics, PoolSummary};
pub use pool::{AgentPool, BackendFactory, PoolConfig};
pub use reservation::{Reservation, ReservationBoard};
pub use router::{RouteDecision, RouterConfig, RouterWeights, RoutingCandidate, TaskRouter};
pub use scaler::{DynamicScaler, ScalingAction, ScalingConfig};
pub use tracker::TaskTracker;
pub use validation::{TaskTypeRule, TaskValidator};
