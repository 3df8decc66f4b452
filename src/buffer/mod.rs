//! Experience buffers
//!
//! Each agent owns a bounded FIFO replay buffer of its own transitions.

pub mod replay;

pub use replay::ReplayBuffer;
