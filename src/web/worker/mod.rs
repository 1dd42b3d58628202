//! Out-of-process model workers.
//!
//! Each model runs in its own worker server process for:
//! - Memory reclaim: stopping the process frees all VRAM/RAM
//! - Crash isolation: a worker crash doesn't take the router down

pub mod control;
pub mod invocation;
pub mod process;
pub mod supervisor;
