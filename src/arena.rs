//! Bump-pointer arena, standing in for the fixed-size memory regions of
//! spec.md 2.2/5 (Arena-V, Arena-C). On a host with a real heap the
//! distinction between "top-down" and "bottom-up" growth no longer matters
//! for correctness, but the direction is kept as real, observable behavior
//! (not just a comment) so the scope-restore invariant in spec.md 8 stays
//! testable. Arena-P (program text) and Arena-X have no arena here at all:
//! program text lives in `ProgramStore`'s `Vec<String>` and subroutine
//! linkage in `Linker`'s two `Vec`s, both ordinary growable collections
//! rather than a second bump region sharing capacity with anything else.

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// An opaque snapshot of an arena's bump pointer. Only `Arena::restore` can
/// consume one, and only the arena that produced it should be passed one
/// back — callers that thread the wrong checkpoint to the wrong arena will
/// simply fail the high-water-mark check in `restore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Checkpoint(usize);

pub struct Arena {
    direction: Direction,
    capacity: usize,
    used: usize,
}

impl Arena {
    pub fn new(capacity: usize, direction: Direction) -> Arena {
        Arena { direction, capacity, used: 0 }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Bump-allocate `size` units, returning a logical address: an offset
    /// from zero growing upward for `Direction::Up`, or an offset counted
    /// down from `capacity` for `Direction::Down`. Either way the value
    /// returned is where this allocation's *first* unit lives.
    pub fn alloc(&mut self, size: usize) -> Result<usize> {
        if size > self.remaining() {
            return Err(EngineError::ArenaExhausted);
        }
        let addr = match self.direction {
            Direction::Up => self.used,
            Direction::Down => self.capacity - self.used - size,
        };
        self.used += size;
        Ok(addr)
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.used)
    }

    /// Resets the bump pointer to a prior checkpoint. A checkpoint can only
    /// move the pointer backward (toward zero used); restoring forward
    /// would silently resurrect freed storage and is rejected.
    pub fn restore(&mut self, checkpoint: Checkpoint) -> Result<()> {
        if checkpoint.0 > self.used {
            return Err(EngineError::ArenaExhausted);
        }
        self.used = checkpoint.0;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bump_up() {
        let mut a = Arena::new(16, Direction::Up);
        assert_eq!(a.alloc(4).unwrap(), 0);
        assert_eq!(a.alloc(4).unwrap(), 4);
    }

    #[test]
    fn bump_down() {
        let mut a = Arena::new(16, Direction::Down);
        assert_eq!(a.alloc(4).unwrap(), 12);
        assert_eq!(a.alloc(4).unwrap(), 8);
    }

    #[test]
    fn exhaustion_is_recoverable_error() {
        let mut a = Arena::new(4, Direction::Up);
        assert!(a.alloc(4).is_ok());
        assert!(matches!(a.alloc(1), Err(EngineError::ArenaExhausted)));
    }

    #[test]
    fn checkpoint_restore_round_trip() {
        let mut a = Arena::new(64, Direction::Up);
        let cp = a.checkpoint();
        a.alloc(10).unwrap();
        a.alloc(10).unwrap();
        a.restore(cp).unwrap();
        assert_eq!(a.used(), cp.0);
    }
}
