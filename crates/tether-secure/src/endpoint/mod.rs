//! Transport-free endpoint state machines.
//!
//! Each endpoint is driven by a single `handle(ServerMessage)` dispatch that
//! returns the actions the surrounding process should perform (send a frame,
//! write to the PTY, render output). Nothing here owns a socket, which keeps
//! the transition table testable on its own.

pub mod cli;
pub mod web;

pub use cli::{CliAction, CliEndpoint, CliPhase, TerminalState};
pub use web::{WebAction, WebEndpoint, WebPhase};
