//! Module providing injectable random index sources.

use ::rand::Rng;
use std::cell::RefCell;
use std::collections::VecDeque;

/// A source of uniformly distributed indices.
///
/// The load balancer breaks ties (bootstrap pick, steal target) by drawing from a [`RandSource`].
/// Plugging in a deterministic source makes those choices reproducible in tests.
pub trait RandSource {
    /// Returns an index in the range `[0, len)`. Callers never pass a zero `len`.
    fn random_index(&self, len: usize) -> usize;
}

/// A [`RandSource`] backed by the thread-local RNG.
#[derive(Default, Clone, Copy, Debug)]
pub struct ThreadRandom;

impl RandSource for ThreadRandom {
    fn random_index(&self, len: usize) -> usize {
        ::rand::rng().random_range(0..len)
    }
}

/// A [`RandSource`] that always picks the same index, clamped to the last valid one.
#[derive(Default, Clone, Copy, Debug)]
pub struct FixedIndex(pub usize);

impl RandSource for FixedIndex {
    fn random_index(&self, len: usize) -> usize {
        self.0.min(len.saturating_sub(1))
    }
}

/// A [`RandSource`] replaying a scripted sequence of indices, then falling back to zero.
#[derive(Default, Debug)]
pub struct ScriptedIndices {
    indices: RefCell<VecDeque<usize>>,
}

impl ScriptedIndices {
    pub fn new<I: IntoIterator<Item = usize>>(indices: I) -> Self {
        Self {
            indices: RefCell::new(indices.into_iter().collect()),
        }
    }
}

impl RandSource for ScriptedIndices {
    fn random_index(&self, len: usize) -> usize {
        let idx = self.indices.borrow_mut().pop_front().unwrap_or(0);
        idx.min(len.saturating_sub(1))
    }
}
