//! Quest dependency scheduler and agent orchestration loop.
//!
//! A quest is a JSON document holding a graph of dependent steps. The runner
//! drives that graph to completion by spawning one external agent per ready
//! step on a bounded pool of lanes, then validates the result with the
//! project's Ward gate and runs a bounded repair loop when it fails.
//!
//! - **[`core`]**: Pure, deterministic logic (readiness, status adjacency,
//!   upsert merging, graph checks, Ward result shaping). No I/O.
//! - **[`io`]**: Side-effecting adapters (quest files, config, processes,
//!   prompts, Ward commands). Behind traits where tests need fakes.
//!
//! [`run`], [`orchestrate`] and [`repair`] coordinate the two into the
//! execution state machine.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrate;
pub mod quest;
pub mod repair;
pub mod run;
pub mod slots;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
