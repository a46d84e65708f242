#![deny(unused)]
//! Bounded sandbox for Tokenweave.
//!
//! This crate provides an isolated execution environment for tenant-authored
//! policy and transformer functions. Scripts run inside a resource-limited
//! engine with no filesystem or ambient I/O access; the only way out is the
//! small set of host functions registered at engine construction.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │  Policy / Transformer execution        │
//! │    ↓ acquires an engine                │
//! ├────────────────────────────────────────┤
//! │  SandboxPool (bounded, reusable)       │
//! │    ↓ hands out EngineHandle            │
//! ├────────────────────────────────────────┤
//! │  ScriptEngine (rhai, limited)          │
//! │    operation budget, call depth cap    │
//! │    host fns: network_request,          │
//! │    check_attribute, get_secret,        │
//! │    audit_log, phone metadata           │
//! └────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tokenweave_sandbox::{HostCapabilities, SandboxPool};
//!
//! let pool = SandboxPool::new(HostCapabilities::default(), config.sandbox.clone());
//! let engine = pool.acquire().await?;
//! let result = engine.run_function(source, "transform", args)?;
//! ```

pub mod engine;
pub mod pool;

pub use engine::{HostCapabilities, ScriptEngine};
pub use pool::{EngineHandle, SandboxPool};
