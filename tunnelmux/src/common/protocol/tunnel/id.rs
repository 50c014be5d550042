// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TunnelId(u64);

impl TunnelId {
  pub fn new(inner: u64) -> TunnelId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }

  pub fn parity(&self) -> Parity {
    Parity::of(self.0)
  }
}

impl From<u64> for TunnelId {
  fn from(inner: u64) -> Self {
    Self::new(inner)
  }
}

impl From<TunnelId> for u64 {
  fn from(id: TunnelId) -> Self {
    id.inner()
  }
}

impl std::fmt::Debug for TunnelId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("TunnelId").field(&self.inner()).finish()
  }
}

impl std::fmt::Display for TunnelId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Parity {
  Odd,
  Even,
}

impl Parity {
  pub fn of(value: u64) -> Self {
    if value % 2 == 1 {
      Parity::Odd
    } else {
      Parity::Even
    }
  }

  /// The first ID handed out by an allocator of this parity
  ///
  /// Zero is never allocated, so that it stays free as a sentinel.
  pub fn seed(&self) -> u64 {
    match self {
      Parity::Odd => 1,
      Parity::Even => 2,
    }
  }
}

/// Monotonic allocator stepping by two from a parity-specific seed
///
/// Two generators of opposite parity never yield the same ID, which lets
/// both ends of a session allocate without coordination.
#[derive(Debug)]
pub struct ParityGenerator {
  next: AtomicU64,
}

impl ParityGenerator {
  pub fn new(parity: Parity) -> Self {
    Self {
      next: AtomicU64::new(parity.seed()),
    }
  }

  pub fn next(&self) -> TunnelId {
    TunnelId::new(self.next.fetch_add(2, Ordering::Relaxed))
  }
}

#[cfg(test)]
mod tests {
  use super::{Parity, ParityGenerator, TunnelId};
  use std::collections::HashSet;

  #[test]
  fn opposite_parities_never_collide() {
    let odd = ParityGenerator::new(Parity::Odd);
    let even = ParityGenerator::new(Parity::Even);
    let mut seen = HashSet::new();
    for _ in 0..10_000 {
      let (a, b) = (odd.next(), even.next());
      assert_eq!(a.parity(), Parity::Odd);
      assert_eq!(b.parity(), Parity::Even);
      assert_ne!(a.inner() % 2, b.inner() % 2);
      assert!(seen.insert(a), "odd allocator repeated {:?}", a);
      assert!(seen.insert(b), "even allocator repeated {:?}", b);
    }
  }

  #[test]
  fn allocation_steps_by_two_from_seed() {
    let odd = ParityGenerator::new(Parity::Odd);
    assert_eq!(odd.next(), TunnelId::new(1));
    assert_eq!(odd.next(), TunnelId::new(3));
    let even = ParityGenerator::new(Parity::Even);
    assert_eq!(even.next(), TunnelId::new(2));
    assert_eq!(even.next(), TunnelId::new(4));
  }

  #[test]
  fn concurrent_allocation_is_unique() {
    use std::sync::Arc;
    let gen = Arc::new(ParityGenerator::new(Parity::Even));
    let handles = (0..4)
      .map(|_| {
        let gen = Arc::clone(&gen);
        std::thread::spawn(move || (0..1000).map(|_| gen.next()).collect::<Vec<_>>())
      })
      .collect::<Vec<_>>();
    let mut all = HashSet::new();
    for handle in handles {
      for id in handle.join().unwrap() {
        assert!(all.insert(id));
      }
    }
    assert_eq!(all.len(), 4000);
  }
}
