//! mcall — a Kubernetes-native task and workflow orchestration operator.
//!
//! Two custom resources, `Task` and `Workflow`, are reconciled by a pair of
//! controllers sharing one client. Tasks execute side-effectful work (shell
//! commands, HTTP requests, remote JSON-RPC tool calls) and report observed
//! state back into their status; Workflows materialize DAGs of child Tasks
//! from blueprints and aggregate their phases.

pub mod cli;
pub mod controllers;
pub mod crd;
pub mod engine;
pub mod error;
pub mod executors;
pub mod repository;
