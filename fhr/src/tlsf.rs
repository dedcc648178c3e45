//! Two-level segregated fit allocator over a fixed range of abstract
//! elements, used to sub-allocate a device memory pool. Free blocks are
//! segregated by a power-of-two first level and a linear second level, both
//! indexed through bitmaps, so allocation and free run in constant time with
//! no dynamic allocation on the hot path: block descriptors live in a fixed
//! arena with a recycled-handle stack.

/// Number of first-level (power of two) size classes.
pub const FL_COUNT: usize = 24;
/// log2 of the number of second-level subdivisions per first level.
pub const SL_BITS: u32 = 4;
/// Number of second-level subdivisions per first level.
pub const SL_COUNT: usize = 1 << SL_BITS;
/// Capacity of the block descriptor arena.
pub const MAX_BLOCKS: usize = 4096;

/// Sentinel for absent descriptor links.
const NIL: u32 = u32::MAX;


/// A successful allocation: the offset of the block within the managed range
/// and its actual size, never smaller than requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub offset: u32,
    pub size: u32,
}


#[derive(Debug, Clone, Copy)]
struct BlockDesc {
    offset: u32,
    size: u32,
    /// Whether the block is currently free.
    free: bool,
    /// Whether the descriptor is in use at all; recycled descriptors stay in
    /// the arena but are skipped by the statistics.
    live: bool,
    /// Physical neighbour links, kept in offset order for coalescing.
    prev_phys: u32,
    next_phys: u32,
    /// Links within the free list of the block's size bucket.
    prev_free: u32,
    next_free: u32,
}

impl BlockDesc {

    const INIT: Self = Self {
        offset: 0,
        size: 0,
        free: false,
        live: false,
        prev_phys: NIL,
        next_phys: NIL,
        prev_free: NIL,
        next_free: NIL,
    };

}


/// The allocator. Manages the abstract range `[0, capacity)`; what an
/// element is (bytes of a GPU heap, slots of an instance buffer) is up to
/// the caller.
pub struct TlsfAllocator {
    capacity: u32,
    blocks: Vec<BlockDesc>,
    /// Handles of recycled descriptors, reused before the arena grows.
    recycled: Vec<u32>,
    /// One bit per first level with a non-empty bucket.
    fl_bitmap: u32,
    /// One bit per non-empty second-level bucket, per first level.
    sl_bitmap: [u16; FL_COUNT],
    free_heads: [[u32; SL_COUNT]; FL_COUNT],
}

impl TlsfAllocator {

    /// Create an allocator over `[0, capacity)`. The capacity must fit the
    /// first-level mapping, so below `2^24` elements.
    pub fn new(capacity: u32) -> Self {

        assert!(capacity > 0 && capacity < (1 << FL_COUNT), "capacity out of range");

        let mut allocator = Self {
            capacity,
            blocks: Vec::new(),
            recycled: Vec::new(),
            fl_bitmap: 0,
            sl_bitmap: [0; FL_COUNT],
            free_heads: [[NIL; SL_COUNT]; FL_COUNT],
        };

        let initial = allocator.alloc_desc().expect("empty arena has room");
        {
            let block = &mut allocator.blocks[initial as usize];
            block.offset = 0;
            block.size = capacity;
        }
        allocator.insert_free(initial);

        allocator

    }

    /// Managed capacity in elements.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// First-level index of a size, the floor of its base-2 logarithm.
    #[inline]
    fn fl_index(size: u32) -> usize {
        (31 - size.leading_zeros()).min(FL_COUNT as u32 - 1) as usize
    }

    /// Bucket of a block of the given size.
    #[inline]
    fn mapping(size: u32) -> (usize, usize) {
        let fl = Self::fl_index(size);
        let sl = if fl as u32 >= SL_BITS {
            ((size >> (fl as u32 - SL_BITS)) ^ (1 << SL_BITS)) as usize
        } else {
            0
        };
        (fl, sl)
    }

    /// Allocate at least `size` elements. Returns the block's offset and
    /// actual size, or `None` when the request is zero or nothing fits.
    pub fn alloc(&mut self, size: u32) -> Option<Allocation> {

        if size == 0 || size > self.capacity {
            return None;
        }

        // Round the request up so the searched bucket only contains blocks
        // of at least `size`; without this a block slightly smaller than the
        // request could be returned and underflow the split below.
        let fl = Self::fl_index(size);
        let rounded = if fl as u32 >= SL_BITS {
            size.saturating_add((1 << (fl as u32 - SL_BITS)) - 1)
        } else {
            size
        };
        if rounded >= 1 << FL_COUNT {
            return None;
        }

        let handle = self.find_block(size, rounded)?;
        self.remove_free(handle);

        let block = self.blocks[handle as usize];
        if block.size > size {
            // Split the remainder off as a new free block, unless the arena
            // is out of descriptors, in which case the caller just gets a
            // larger block.
            if let Some(remainder) = self.alloc_desc() {
                {
                    let desc = &mut self.blocks[remainder as usize];
                    desc.offset = block.offset + size;
                    desc.size = block.size - size;
                    desc.prev_phys = handle;
                    desc.next_phys = block.next_phys;
                }
                if block.next_phys != NIL {
                    self.blocks[block.next_phys as usize].prev_phys = remainder;
                }
                self.blocks[handle as usize].next_phys = remainder;
                self.blocks[handle as usize].size = size;
                self.insert_free(remainder);
            }
        }

        let block = &self.blocks[handle as usize];
        Some(Allocation { offset: block.offset, size: block.size })

    }

    /// Free the block starting at the given offset, coalescing it with free
    /// physical neighbours. Returns false when no live allocation starts
    /// there.
    pub fn free(&mut self, offset: u32) -> bool {

        let Some(handle) = self.blocks.iter().position(|block| {
            block.live && !block.free && block.offset == offset
        }) else {
            return false;
        };
        let mut handle = handle as u32;

        // Absorb a free next neighbour.
        let next = self.blocks[handle as usize].next_phys;
        if next != NIL && self.blocks[next as usize].free {
            self.remove_free(next);
            let absorbed = self.blocks[next as usize];
            self.blocks[handle as usize].size += absorbed.size;
            self.blocks[handle as usize].next_phys = absorbed.next_phys;
            if absorbed.next_phys != NIL {
                self.blocks[absorbed.next_phys as usize].prev_phys = handle;
            }
            self.recycle(next);
        }

        // Let a free previous neighbour absorb us.
        let prev = self.blocks[handle as usize].prev_phys;
        if prev != NIL && self.blocks[prev as usize].free {
            self.remove_free(prev);
            let merged = self.blocks[handle as usize];
            self.blocks[prev as usize].size += merged.size;
            self.blocks[prev as usize].next_phys = merged.next_phys;
            if merged.next_phys != NIL {
                self.blocks[merged.next_phys as usize].prev_phys = prev;
            }
            self.recycle(handle);
            handle = prev;
        }

        self.insert_free(handle);
        true

    }

    /// Total number of free elements.
    pub fn total_free(&self) -> u32 {
        self.blocks.iter()
            .filter(|block| block.live && block.free)
            .map(|block| block.size)
            .sum()
    }

    /// Size of the largest free block, zero when everything is allocated.
    pub fn largest_free(&self) -> u32 {
        self.blocks.iter()
            .filter(|block| block.live && block.free)
            .map(|block| block.size)
            .max()
            .unwrap_or(0)
    }

    /// Locate a free block of at least `size`. The bucket of the rounded
    /// request is walked first-fit (it may hold slightly smaller blocks when
    /// the request is below the second-level granularity); any block of a
    /// strictly higher bucket is large enough by construction.
    fn find_block(&self, size: u32, rounded: u32) -> Option<u32> {

        let (fl, sl) = Self::mapping(rounded);

        let mut handle = self.free_heads[fl][sl];
        while handle != NIL {
            if self.blocks[handle as usize].size >= size {
                return Some(handle);
            }
            handle = self.blocks[handle as usize].next_free;
        }

        // Same first level, strictly higher second level.
        let sl_mask = self.sl_bitmap[fl] & (u16::MAX << sl) & !(1 << sl);
        if sl_mask != 0 {
            let sl = sl_mask.trailing_zeros() as usize;
            return Some(self.free_heads[fl][sl]);
        }

        // Strictly higher first level.
        if fl + 1 >= FL_COUNT {
            return None;
        }
        let fl_mask = self.fl_bitmap & (u32::MAX << (fl + 1));
        if fl_mask == 0 {
            return None;
        }
        let fl = fl_mask.trailing_zeros() as usize;
        let sl = self.sl_bitmap[fl].trailing_zeros() as usize;
        Some(self.free_heads[fl][sl])

    }

    fn insert_free(&mut self, handle: u32) {

        let size = self.blocks[handle as usize].size;
        let (fl, sl) = Self::mapping(size);

        let head = self.free_heads[fl][sl];
        {
            let block = &mut self.blocks[handle as usize];
            block.free = true;
            block.prev_free = NIL;
            block.next_free = head;
        }
        if head != NIL {
            self.blocks[head as usize].prev_free = handle;
        }
        self.free_heads[fl][sl] = handle;

        self.fl_bitmap |= 1 << fl;
        self.sl_bitmap[fl] |= 1 << sl;

    }

    fn remove_free(&mut self, handle: u32) {

        let block = self.blocks[handle as usize];
        let (fl, sl) = Self::mapping(block.size);

        if block.prev_free != NIL {
            self.blocks[block.prev_free as usize].next_free = block.next_free;
        } else {
            self.free_heads[fl][sl] = block.next_free;
        }
        if block.next_free != NIL {
            self.blocks[block.next_free as usize].prev_free = block.prev_free;
        }

        if self.free_heads[fl][sl] == NIL {
            self.sl_bitmap[fl] &= !(1 << sl);
            if self.sl_bitmap[fl] == 0 {
                self.fl_bitmap &= !(1 << fl);
            }
        }

        let block = &mut self.blocks[handle as usize];
        block.free = false;
        block.prev_free = NIL;
        block.next_free = NIL;

    }

    fn alloc_desc(&mut self) -> Option<u32> {
        if let Some(handle) = self.recycled.pop() {
            self.blocks[handle as usize] = BlockDesc { live: true, ..BlockDesc::INIT };
            return Some(handle);
        }
        if self.blocks.len() < MAX_BLOCKS {
            let handle = self.blocks.len() as u32;
            self.blocks.push(BlockDesc { live: true, ..BlockDesc::INIT });
            return Some(handle);
        }
        None
    }

    fn recycle(&mut self, handle: u32) {
        self.blocks[handle as usize] = BlockDesc::INIT;
        self.recycled.push(handle);
    }

}
