//! The per piece lifecycle gate.
//!
//! Every piece is created empty (or complete when restored), turns dirty on
//! a successful reservation by a writer, and either commits to complete
//! after a full hash-verified write or rolls back to empty. Complete is
//! terminal. The compare-and-swap on reservation is what guarantees at most
//! one writer per piece without blocking.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::store::WriteError;

/// The status byte persisted in the piece status metadata. Anything else
/// found on disk is coerced to empty.
pub(crate) const STATUS_EMPTY: u8 = 0;
pub(crate) const STATUS_COMPLETE: u8 = 1;
/// In-memory only; a dirty piece that never commits restores as empty.
const STATUS_DIRTY: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    Empty,
    Dirty,
    Complete,
}

pub(crate) struct Piece {
    status: AtomicU8,
}

impl Piece {
    pub fn new(status: PieceStatus) -> Self {
        let raw = match status {
            PieceStatus::Empty => STATUS_EMPTY,
            PieceStatus::Dirty => STATUS_DIRTY,
            PieceStatus::Complete => STATUS_COMPLETE,
        };
        Self {
            status: AtomicU8::new(raw),
        }
    }

    pub fn status(&self) -> PieceStatus {
        match self.status.load(Ordering::SeqCst) {
            STATUS_COMPLETE => PieceStatus::Complete,
            STATUS_DIRTY => PieceStatus::Dirty,
            _ => PieceStatus::Empty,
        }
    }

    /// Attempts the `Empty -> Dirty` transition; a racing second writer
    /// observes the loser's state instead of blocking.
    pub fn acquire(&self) -> Result<(), WriteError> {
        match self.status.compare_exchange(
            STATUS_EMPTY,
            STATUS_DIRTY,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => Ok(()),
            Err(STATUS_COMPLETE) => Err(WriteError::PieceComplete),
            Err(_) => Err(WriteError::WriteConflict),
        }
    }

    /// `Dirty -> Complete`, after the write has been verified and the status
    /// byte persisted. Terminal.
    pub fn commit(&self) {
        let prev = self.status.swap(STATUS_COMPLETE, Ordering::SeqCst);
        debug_assert_eq!(prev, STATUS_DIRTY);
    }

    /// `Dirty -> Empty`, after any write failure.
    pub fn release(&self) {
        let prev = self.status.swap(STATUS_EMPTY, Ordering::SeqCst);
        debug_assert_eq!(prev, STATUS_DIRTY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_writer_wins_acquire() {
        let piece = Piece::new(PieceStatus::Empty);
        piece.acquire().unwrap();
        assert!(matches!(
            piece.acquire(),
            Err(WriteError::WriteConflict)
        ));
        assert_eq!(piece.status(), PieceStatus::Dirty);
    }

    #[test]
    fn test_complete_is_terminal() {
        let piece = Piece::new(PieceStatus::Empty);
        piece.acquire().unwrap();
        piece.commit();
        assert_eq!(piece.status(), PieceStatus::Complete);
        assert!(matches!(piece.acquire(), Err(WriteError::PieceComplete)));
    }

    #[test]
    fn test_release_returns_to_empty() {
        let piece = Piece::new(PieceStatus::Empty);
        piece.acquire().unwrap();
        piece.release();
        assert_eq!(piece.status(), PieceStatus::Empty);
        piece.acquire().unwrap();
    }
}
