use std::time::Instant;

use rand::prelude::*;
use rand::rngs::StdRng;

/// Explicit random-number service. One instance is seeded per run and passed
/// by reference to every component that consumes random bits, so a fixed seed
/// reproduces the full move sequence.
pub struct Random {
    rng: StdRng,
}

impl Random {
    pub fn with_seed(seed: u64) -> Self {
        Random {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub(crate) fn index(&mut self, upper: usize) -> usize {
        debug_assert!(upper > 0);
        self.rng.gen_range(0..upper)
    }

    pub(crate) fn float(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    pub(crate) fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }

    /// Picks one element of a non-empty tie set uniformly at random.
    pub(crate) fn pick<T: Copy>(&mut self, ties: &[T]) -> T {
        ties[self.index(ties.len())]
    }
}

/// Append-only wall-clock bookkeeping. Spans are recorded in call order;
/// the evolutionary loop polls `total_evolutionary` at its head.
#[derive(Default)]
pub struct Timer {
    evolutionary: Vec<f64>,
    total_evolutionary: f64,
}

impl Timer {
    pub fn new() -> Self {
        Timer::default()
    }

    pub fn start_span() -> Instant {
        Instant::now()
    }

    pub(crate) fn add_evolutionary(&mut self, seconds: f64) {
        self.evolutionary.push(seconds);
        self.total_evolutionary += seconds;
    }

    pub fn total_evolutionary(&self) -> f64 {
        self.total_evolutionary
    }

    pub(crate) fn evolutionary_spans(&self) -> &[f64] {
        &self.evolutionary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_random_is_reproducible() {
        let mut a = Random::with_seed(42);
        let mut b = Random::with_seed(42);
        for _ in 0..32 {
            assert_eq!(a.index(1000), b.index(1000));
        }
        assert_eq!(a.float(), b.float());
    }

    #[test]
    fn timer_accumulates_in_call_order() {
        let mut timer = Timer::new();
        timer.add_evolutionary(1.5);
        timer.add_evolutionary(0.5);
        assert_eq!(timer.evolutionary_spans(), &[1.5, 0.5]);
        assert_eq!(timer.total_evolutionary(), 2.0);
    }
}
