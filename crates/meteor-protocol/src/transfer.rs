//! Chunked result transfer.
//!
//! The scheduler answers a result request with a JSON header naming the
//! negotiated block size and block count, then streams the file as that
//! many binary blocks. The last block carries whatever remains, so the
//! concatenation of all blocks is always the full file.

use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Reasons a block request cannot be served.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    #[error("block size must be positive, got {0}")]
    BlockSize(i64),
    #[error("maximum number of blocks must be positive, got {0}")]
    BlockCount(i64),
}

/// Negotiated layout of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPlan {
    /// Total length of the source in bytes.
    pub len: u64,
    /// Nominal size of each block.
    pub block_size: u64,
    /// Number of blocks that will be sent.
    pub total_blocks: u64,
}

impl BlockPlan {
    /// Derive a plan from the client's wishes.
    ///
    /// The desired size is clamped to `max_block_size`. When honouring it
    /// would need more than `max_blocks` blocks, the block size grows to
    /// `len / max_blocks` and exactly `max_blocks` blocks are sent.
    pub fn negotiate(
        len: u64,
        desired_block_size: i64,
        max_blocks: i64,
        max_block_size: u64,
    ) -> Result<Self, NegotiationError> {
        if desired_block_size <= 0 {
            return Err(NegotiationError::BlockSize(desired_block_size));
        }
        if max_blocks <= 0 {
            return Err(NegotiationError::BlockCount(max_blocks));
        }
        let max_block_size = max_block_size.max(1);
        let max_blocks = max_blocks as u64;
        let mut block_size = (desired_block_size as u64).min(max_block_size);

        if len == 0 {
            return Ok(Self {
                len,
                block_size,
                total_blocks: 0,
            });
        }

        let total_blocks = if len / block_size > max_blocks {
            block_size = len / max_blocks;
            max_blocks
        } else {
            let mut total = ((len + 1) / block_size).max(1);
            // never announce an empty trailing block
            if (total - 1) * block_size >= len {
                total -= 1;
            }
            total
        };

        Ok(Self {
            len,
            block_size,
            total_blocks,
        })
    }

    /// Byte range of block `index`; empty past the end.
    pub fn block_range(&self, index: u64) -> Range<u64> {
        if index >= self.total_blocks {
            return self.len..self.len;
        }
        let start = index * self.block_size;
        let end = if index + 1 == self.total_blocks {
            self.len
        } else {
            (start + self.block_size).min(self.len)
        };
        start..end
    }

    pub fn blocks(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        (0..self.total_blocks).map(move |i| self.block_range(i))
    }
}

/// One block of a result file as seen by the receiving client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFileBlock {
    pub bytes: Vec<u8>,
    /// Content encoding announced by the sender.
    pub encoding: String,
    /// Zero-based position of the block.
    pub block_index: u64,
    pub block_size: u64,
    pub total_blocks: u64,
}

impl ResultFileBlock {
    pub fn is_last(&self) -> bool {
        self.block_index + 1 >= self.total_blocks
    }

    /// Block content as text, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}
