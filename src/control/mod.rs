//! The control plane: the arbiter that serialises command-mode
//! sessions against the data-plane receive loop, and the radio operations
//! library built on top of it.

mod arbiter;
pub mod firmware;
pub mod ops;

pub use arbiter::{Arbiter, ArbiterHandle, CommandSession, LinkState};
