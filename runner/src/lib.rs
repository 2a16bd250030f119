//! Autonomous directive-consumption runner.
//!
//! An external lifecycle state machine (`sdlc`) emits one directive per
//! feature describing the next required action. This crate repeatedly reads
//! that directive, decides whether it can be automated, runs an LLM agent with
//! the right model and tool allowlist, and keeps enough state to resume a
//! feature across invocations. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (data model, tokenizer, registry,
//!   loop bounds). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (state machine CLI, agent driver,
//!   gate processes, session files, config). Isolated behind traits where tests
//!   need fakes.
//!
//! Orchestration modules ([`looping`], [`batch`], [`plan`]) compose the two to
//! implement CLI commands.

pub mod batch;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod plan;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
