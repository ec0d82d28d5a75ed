//! Module providing sources of randomness and time that can be swapped out in tests.

pub mod rand;
pub mod time;
