//! Fixed classifier memory.
//!
//! One region is reserved at startup and carved into spans while the graph
//! is planned. Nothing is allocated from the heap after that.

use crate::error::StartupError;
use std::ops::Range;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub offset: usize,
    pub len: usize,
}

impl Span {
    pub fn range(self) -> Range<usize> {
        self.offset..self.offset + self.len
    }

    pub fn end(self) -> usize {
        self.offset + self.len
    }
}

#[derive(Debug)]
pub struct Arena {
    buf: Box<[i8]>,
    used: usize,
}

impl Arena {
    /// Reserves `bytes` up front. Failure here is fatal to autonomous mode.
    pub fn reserve(bytes: usize) -> Result<Self, StartupError> {
        let mut buf: Vec<i8> = Vec::new();
        buf.try_reserve_exact(bytes)
            .map_err(|_| StartupError::ArenaReservation { bytes })?;
        buf.resize(bytes, 0);
        Ok(Self {
            buf: buf.into_boxed_slice(),
            used: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.used
    }

    /// Carves the next `len` bytes off the arena.
    pub fn alloc(&mut self, len: usize) -> Result<Span, StartupError> {
        if len > self.remaining() {
            return Err(StartupError::TensorAllocation {
                needed: len,
                available: self.remaining(),
            });
        }
        let span = Span {
            offset: self.used,
            len,
        };
        self.used += len;
        Ok(span)
    }

    /// Allocates a span and fills it with `data`.
    pub fn alloc_copy(&mut self, data: &[i8]) -> Result<Span, StartupError> {
        let span = self.alloc(data.len())?;
        self.buf[span.range()].copy_from_slice(data);
        Ok(span)
    }

    pub fn get(&self, span: Span) -> &[i8] {
        &self.buf[span.range()]
    }

    pub fn get_mut(&mut self, span: Span) -> &mut [i8] {
        &mut self.buf[span.range()]
    }

    /// Read-only view of everything below `dst` alongside `dst` itself.
    /// Spans are handed out in increasing order, so a layer's inputs always
    /// sit below its output.
    pub fn split_at(&mut self, dst: Span) -> (&[i8], &mut [i8]) {
        let (lo, hi) = self.buf.split_at_mut(dst.offset);
        (lo, &mut hi[..dst.len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_are_sequential() {
        let mut arena = Arena::reserve(10).unwrap();
        let a = arena.alloc(4).unwrap();
        let b = arena.alloc_copy(&[1, 2, 3]).unwrap();
        assert_eq!(a, Span { offset: 0, len: 4 });
        assert_eq!(b.offset, 4);
        assert_eq!(arena.get(b), &[1, 2, 3]);
        assert_eq!(arena.remaining(), 3);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut arena = Arena::reserve(4).unwrap();
        arena.alloc(3).unwrap();
        match arena.alloc(2) {
            Err(StartupError::TensorAllocation { needed, available }) => {
                assert_eq!((needed, available), (2, 1));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn impossible_reservation_fails() {
        assert!(matches!(
            Arena::reserve(usize::MAX),
            Err(StartupError::ArenaReservation { .. })
        ));
    }

    #[test]
    fn split_exposes_lower_spans() {
        let mut arena = Arena::reserve(6).unwrap();
        let src = arena.alloc_copy(&[5, 6]).unwrap();
        let dst = arena.alloc(2).unwrap();
        let (lo, out) = arena.split_at(dst);
        out.copy_from_slice(&lo[src.range()]);
        assert_eq!(arena.get(dst), &[5, 6]);
    }
}
