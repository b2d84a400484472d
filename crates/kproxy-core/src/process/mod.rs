//! Kernel host process: launching it and owning its lifetime.

pub mod launcher;
pub mod owner;
