//! Bump arena backing text and blob parameters bound with `SQLITE_STATIC`.
//!
//! SQLite keeps the raw pointer of a statically bound parameter until the
//! binding is cleared, so the bytes must stay put until the owning statement
//! is reset. Blocks are allocated with a fixed capacity and never grown, which
//! keeps every handed-out pointer stable until [`ParamArena::release_all`].

const BLOCK_SIZE: usize = 4 * 1024;

/// Location of one allocation inside the arena.
#[derive(Clone, Copy, Debug)]
pub struct ArenaSlot {
    ptr: *const u8,
    len: usize,
}

impl ArenaSlot {
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Per-statement pool of parameter buffers, released all at once.
#[derive(Debug, Default)]
pub struct ParamArena {
    blocks: Vec<Vec<u8>>,
    slots: usize,
}

impl ParamArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `bytes` into the arena.
    pub fn allocate(&mut self, bytes: &[u8]) -> ArenaSlot {
        let needs_block = self
            .blocks
            .last()
            .is_none_or(|block| block.capacity() - block.len() < bytes.len());
        if needs_block {
            self.blocks
                .push(Vec::with_capacity(bytes.len().max(BLOCK_SIZE)));
        }
        let index = self.blocks.len() - 1;
        let block = &mut self.blocks[index];
        let start = block.len();
        // Stays within capacity, so the buffer never moves.
        block.extend_from_slice(bytes);
        self.slots += 1;
        ArenaSlot {
            ptr: block[start..].as_ptr(),
            len: bytes.len(),
        }
    }

    /// Releases every allocation. The first block is kept for reuse.
    pub fn release_all(&mut self) {
        self.blocks.truncate(1);
        if let Some(block) = self.blocks.first_mut() {
            block.clear();
        }
        self.slots = 0;
    }

    /// Number of live allocations since the last release.
    pub fn live(&self) -> usize {
        self.slots
    }

    pub fn bytes_in_use(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }
}
