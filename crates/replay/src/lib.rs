// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Time-travel replay for Retrace
//!
//! Reconstructs the system state at any past instant from the nearest
//! snapshot plus forward event replay, computes structured state diffs and
//! causal critical paths, and evaluates conditional breakpoints against
//! `(state, event)` pairs during replay.

pub mod breakpoint;
pub mod critical_path;
pub mod cursor;
pub mod expr;
pub mod reconstruct;

pub use breakpoint::{
    Breakpoint, BreakpointBundle, BreakpointCondition, BreakpointEngine, BreakpointError,
    BreakpointImportOutcome, Hit, PerformanceMetric, ThresholdOp,
};
pub use critical_path::{CriticalPath, CycleDetected};
pub use cursor::{Bookmarks, ReplayCursor};
pub use expr::{compile, Expr, ExprError};
pub use reconstruct::{OriginPoint, Reconstructor, ReplayCursorPos, ReplayError};
pub use retrace_core::diff::{diff_states, StateDiff};
