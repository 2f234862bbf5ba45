//! Multi-event raw-data buffers
//!
//! A buffer holds several COPPER blocks back to back. The position of the
//! n-th block is found by walking the `POS_NWORDS` length word of every
//! preceding block.

use super::copper::CopperBlock;
use super::error::{DecodeError, DecodeResult};
use super::layout::{raw_header, MIN_BLOCK_NWORDS};

/// Read-only view over a buffer of consecutive COPPER blocks
#[derive(Debug, Clone, Copy)]
pub struct RawDataBlock<'a> {
    words: &'a [u32],
    num_events: usize,
}

impl<'a> RawDataBlock<'a> {
    /// Wrap a buffer declared to hold `num_events` blocks
    pub fn new(words: &'a [u32], num_events: usize) -> Self {
        Self { words, num_events }
    }

    /// Wrap a buffer and count its blocks by walking the length words
    ///
    /// Fails if a length word is zero, too small, or runs past the buffer.
    pub fn scan(words: &'a [u32]) -> DecodeResult<Self> {
        let mut pos = 0;
        let mut count = 0;
        while pos < words.len() {
            let nwords = block_nwords_at(words, pos)?;
            pos += nwords;
            count += 1;
        }
        Ok(Self {
            words,
            num_events: count,
        })
    }

    pub fn num_events(&self) -> usize {
        self.num_events
    }

    pub fn total_nwords(&self) -> usize {
        self.words.len()
    }

    /// Word offset of the n-th block
    pub fn buffer_pos(&self, n: usize) -> DecodeResult<usize> {
        if n >= self.num_events {
            return Err(DecodeError::EventOutOfRange {
                index: n,
                count: self.num_events,
            });
        }
        let mut pos = 0;
        for _ in 0..n {
            pos += block_nwords_at(self.words, pos)?;
        }
        if pos >= self.words.len() {
            return Err(DecodeError::out_of_bounds(
                "event position",
                pos,
                0,
                self.words.len(),
            ));
        }
        Ok(pos)
    }

    /// Declared length of the n-th block
    pub fn block_nwords(&self, n: usize) -> DecodeResult<usize> {
        let pos = self.buffer_pos(n)?;
        block_nwords_at(self.words, pos)
    }

    /// Words of the n-th block
    pub fn block_words(&self, n: usize) -> DecodeResult<&'a [u32]> {
        let pos = self.buffer_pos(n)?;
        let nwords = block_nwords_at(self.words, pos)?;
        Ok(&self.words[pos..pos + nwords])
    }

    /// Reader for the n-th block
    pub fn block(&self, n: usize) -> DecodeResult<CopperBlock<'a>> {
        CopperBlock::new(self.block_words(n)?)
    }

    /// Iterate over all blocks
    ///
    /// A malformed block is yielded as an error; iteration continues with
    /// the next block when its position can still be determined.
    pub fn iter(&self) -> impl Iterator<Item = DecodeResult<CopperBlock<'a>>> + '_ {
        (0..self.num_events).map(move |n| self.block(n))
    }
}

/// Length word at `pos`, bound-checked against the buffer
fn block_nwords_at(words: &[u32], pos: usize) -> DecodeResult<usize> {
    let Some(&word) = words.get(pos + raw_header::POS_NWORDS) else {
        return Err(DecodeError::out_of_bounds("length word", pos, 1, words.len()));
    };
    let nwords = word as usize;
    if nwords < MIN_BLOCK_NWORDS {
        return Err(DecodeError::TooShort {
            needed: MIN_BLOCK_NWORDS,
            available: nwords,
        });
    }
    if pos + nwords > words.len() {
        return Err(DecodeError::out_of_bounds("block", pos, nwords, words.len()));
    }
    Ok(nwords)
}
