//! Conversion of raw usage into billing blocks.

use shared::protocol::{DEFAULT_CHARACTERS_PER_BLOCK, DEFAULT_SECONDS_PER_BLOCK};

/// Size of one billing block for each block-billed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSizes {
    pub seconds_per_block: u32,
    pub characters_per_block: u32,
}

impl Default for BlockSizes {
    fn default() -> Self {
        Self {
            seconds_per_block: DEFAULT_SECONDS_PER_BLOCK,
            characters_per_block: DEFAULT_CHARACTERS_PER_BLOCK,
        }
    }
}

impl BlockSizes {
    /// `ceil(duration / seconds_per_block)`
    pub fn seconds_to_blocks(&self, duration_seconds: u32) -> i64 {
        blocks(u64::from(duration_seconds), self.seconds_per_block)
    }

    /// `ceil(count / characters_per_block)`, counting Unicode scalar values
    pub fn characters_to_blocks(&self, count: usize) -> i64 {
        blocks(count as u64, self.characters_per_block)
    }

    pub fn text_to_blocks(&self, text: &str) -> i64 {
        self.characters_to_blocks(text.chars().count())
    }
}

// Block sizes are validated non-zero at startup.
fn blocks(amount: u64, block_size: u32) -> i64 {
    let size = u64::from(block_size.max(1));
    amount.div_ceil(size) as i64
}
