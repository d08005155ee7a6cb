#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Artifact Store, Scheduler, Executor, Control Channel, Main Loop, and the
//! cancellation-scope lifecycle machinery that ties them together.

pub mod artifact;
pub mod control;
pub mod executor;
pub mod lifecycle;
pub mod mainloop;
pub mod scheduler;
pub mod simulate;

pub use mainloop::{run_main_loop, MainLoopConfig};
