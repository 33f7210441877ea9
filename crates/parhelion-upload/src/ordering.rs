//! Per-destination upload ordering.
//!
//! Each destination resource carries one binary semaphore that the last
//! upload to it signaled. The next upload to the same destination waits on
//! that semaphore and re-arms it, so successive writes to one resource
//! execute in submission order even when they go through different staging
//! regions. Uploads to different destinations are unordered relative to
//! each other.

use ash::vk;
use hashbrown::HashMap;
use parhelion_gpu::Result;

/// Maps destination identity (raw handle) to its ordering semaphore.
#[derive(Default)]
pub struct OrderingChain {
    last: HashMap<u64, vk::Semaphore>,
}

impl OrderingChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of destinations tracked.
    pub fn len(&self) -> usize {
        self.last.len()
    }

    /// Whether no destination has been uploaded to yet.
    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }

    /// Resolve the wait/signal pair for the next upload to `dest`.
    ///
    /// The first upload to a destination has nothing to wait on and
    /// registers a freshly created semaphore; every later upload waits on
    /// the registered semaphore and signals it again for the writer after
    /// it.
    pub fn acquire(
        &mut self,
        dest: u64,
        create: impl FnOnce() -> Result<vk::Semaphore>,
    ) -> Result<(Option<vk::Semaphore>, vk::Semaphore)> {
        if let Some(&semaphore) = self.last.get(&dest) {
            return Ok((Some(semaphore), semaphore));
        }

        let semaphore = create()?;
        self.last.insert(dest, semaphore);
        Ok((None, semaphore))
    }

    /// Drop a destination's entry, returning its semaphore for destruction.
    pub fn remove(&mut self, dest: u64) -> Option<vk::Semaphore> {
        self.last.remove(&dest)
    }

    /// Take every semaphore for teardown.
    pub fn drain(&mut self) -> Vec<vk::Semaphore> {
        self.last.drain().map(|(_, semaphore)| semaphore).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::Cell;

    fn fake_factory(counter: &Cell<u64>) -> impl FnOnce() -> Result<vk::Semaphore> + '_ {
        move || {
            counter.set(counter.get() + 1);
            Ok(vk::Semaphore::from_raw(counter.get()))
        }
    }

    #[test]
    fn first_upload_has_no_wait() {
        let counter = Cell::new(0);
        let mut chain = OrderingChain::new();

        let (wait, signal) = chain.acquire(7, fake_factory(&counter)).unwrap();
        assert_eq!(wait, None);
        assert_eq!(signal.as_raw(), 1);
    }

    #[test]
    fn second_upload_waits_on_first_signal() {
        let counter = Cell::new(0);
        let mut chain = OrderingChain::new();

        let (_, first_signal) = chain.acquire(7, fake_factory(&counter)).unwrap();
        let (wait, signal) = chain.acquire(7, fake_factory(&counter)).unwrap();

        // Strict ordering: the second submission waits on exactly what the
        // first signaled, and re-arms the same semaphore.
        assert_eq!(wait, Some(first_signal));
        assert_eq!(signal, first_signal);
        // No extra semaphore was created
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn destinations_are_independent() {
        let counter = Cell::new(0);
        let mut chain = OrderingChain::new();

        let (_, sem_a) = chain.acquire(1, fake_factory(&counter)).unwrap();
        let (wait_b, sem_b) = chain.acquire(2, fake_factory(&counter)).unwrap();

        assert_eq!(wait_b, None);
        assert_ne!(sem_a, sem_b);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn drain_returns_all_semaphores() {
        let counter = Cell::new(0);
        let mut chain = OrderingChain::new();
        chain.acquire(1, fake_factory(&counter)).unwrap();
        chain.acquire(2, fake_factory(&counter)).unwrap();

        let drained = chain.drain();
        assert_eq!(drained.len(), 2);
        assert!(chain.is_empty());
    }
}
