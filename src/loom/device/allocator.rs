use derive_more::Display;
use itertools::Itertools;
use thiserror::Error;

/// Reference to a chunk of a [`MemoryRegion`]. Stale once the chunk is freed or merged.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("{index}:{generation}")]
pub struct ChunkId {
    index: u32,
    generation: u32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("out of device memory: requested {requested} bytes, largest free chunk has {largest}")]
    OutOfMemory { requested: usize, largest: usize },
    #[error("invalid chunk {0}")]
    InvalidChunk(ChunkId),
    #[error("chunk {0} is already free")]
    DoubleFree(ChunkId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionConfig {
    /// Every chunk starts and ends on a multiple of this. Must be a power of two.
    pub alignment: usize,
    /// Smallest leftover worth splitting off as its own free chunk.
    pub granularity: usize,
}

impl RegionConfig {
    #[inline]
    pub const fn with_alignment(alignment: usize) -> Self {
        Self {
            alignment,
            granularity: alignment,
        }
    }
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self::with_alignment(size_of::<usize>())
    }
}

/// A contiguous sub-range of a region, either in use or free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Offset from the region base.
    pub start: usize,
    pub size: usize,
    pub in_use: bool,
}

impl Chunk {
    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.size
    }
}

#[derive(Debug, Clone)]
struct Node {
    chunk: Chunk,
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Debug, Default, Clone)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// First-fit allocator over a device address range.
///
/// Chunks tile the whole region without gaps and are kept in address order; after every `free`
/// no two adjacent chunks are both free.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    base: u64,
    capacity: usize,
    config: RegionConfig,
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    head: u32,
}

impl MemoryRegion {
    pub fn new(base: u64, capacity: usize, config: RegionConfig) -> Self {
        assert!(
            config.alignment.is_power_of_two(),
            "region alignment must be a power of two"
        );
        let node = Node {
            chunk: Chunk {
                start: 0,
                size: capacity,
                in_use: false,
            },
            prev: None,
            next: None,
        };
        Self {
            base,
            capacity,
            config,
            slots: vec![Slot {
                generation: 0,
                node: Some(node),
            }],
            vacant: vec![],
            head: 0,
        }
    }

    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn config(&self) -> RegionConfig {
        self.config
    }

    #[inline]
    fn node(&self, index: u32) -> &Node {
        self.slots[index as usize]
            .node
            .as_ref()
            .expect("linked chunk must be live")
    }

    #[inline]
    fn node_mut(&mut self, index: u32) -> &mut Node {
        self.slots[index as usize]
            .node
            .as_mut()
            .expect("linked chunk must be live")
    }

    #[inline]
    fn id(&self, index: u32) -> ChunkId {
        let generation = self.slots[index as usize].generation;
        ChunkId { index, generation }
    }

    fn resolve(&self, id: ChunkId) -> Result<u32, AllocError> {
        match self.slots.get(id.index as usize) {
            Some(slot) if slot.generation == id.generation && slot.node.is_some() => Ok(id.index),
            _ => Err(AllocError::InvalidChunk(id)),
        }
    }

    fn insert(&mut self, node: Node) -> u32 {
        match self.vacant.pop() {
            Some(index) => {
                self.slots[index as usize].node = Some(node);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn remove(&mut self, index: u32) -> Node {
        let slot = &mut self.slots[index as usize];
        let node = slot.node.take().expect("removed chunk must be live");
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(index);
        node
    }

    /// Rounds a request up to the region alignment. Zero-size requests take one unit.
    #[inline]
    pub fn round_up(&self, size: usize) -> Option<usize> {
        size.max(1).checked_next_multiple_of(self.config.alignment)
    }

    /// Allocates the lowest-addressed free chunk that fits `size` bytes.
    pub fn alloc(&mut self, size: usize) -> Result<ChunkId, AllocError> {
        let Some(size) = self.round_up(size) else {
            return Err(AllocError::OutOfMemory {
                requested: size,
                largest: self.largest_free(),
            });
        };

        let mut cursor = Some(self.head);
        while let Some(index) = cursor {
            let node = self.node(index);
            cursor = node.next;
            if node.chunk.in_use || node.chunk.size < size {
                continue;
            }

            // 1. split off the tail if it is large enough to be useful
            let leftover = node.chunk.size - size;
            if leftover >= self.config.granularity {
                let next = node.next;
                let tail = Node {
                    chunk: Chunk {
                        start: node.chunk.start + size,
                        size: leftover,
                        in_use: false,
                    },
                    prev: Some(index),
                    next,
                };
                let tail = self.insert(tail);
                if let Some(next) = next {
                    self.node_mut(next).prev = Some(tail);
                }
                let node = self.node_mut(index);
                node.next = Some(tail);
                node.chunk.size = size;
            }

            // 2. claim the chunk; ids from earlier tenants of this slot go stale
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            self.node_mut(index).chunk.in_use = true;
            return Ok(self.id(index));
        }

        Err(AllocError::OutOfMemory {
            requested: size,
            largest: self.largest_free(),
        })
    }

    /// Releases a chunk, merging it with free neighbours.
    pub fn free(&mut self, id: ChunkId) -> Result<(), AllocError> {
        let index = self.resolve(id)?;
        if !self.node(index).chunk.in_use {
            return Err(AllocError::DoubleFree(id));
        }
        self.node_mut(index).chunk.in_use = false;

        // 1. absorb the next chunk
        let next = self.node(index).next;
        if let Some(next) = next.filter(|&next| !self.node(next).chunk.in_use) {
            let absorbed = self.remove(next);
            if let Some(after) = absorbed.next {
                self.node_mut(after).prev = Some(index);
            }
            let node = self.node_mut(index);
            node.chunk.size += absorbed.chunk.size;
            node.next = absorbed.next;
        }

        // 2. let the previous chunk absorb this one
        let prev = self.node(index).prev;
        if let Some(prev) = prev.filter(|&prev| !self.node(prev).chunk.in_use) {
            let absorbed = self.remove(index);
            if let Some(after) = absorbed.next {
                self.node_mut(after).prev = Some(prev);
            }
            let node = self.node_mut(prev);
            node.chunk.size += absorbed.chunk.size;
            node.next = absorbed.next;
        }

        Ok(())
    }

    #[inline]
    pub fn chunk(&self, id: ChunkId) -> Result<Chunk, AllocError> {
        let index = self.resolve(id)?;
        Ok(self.node(index).chunk)
    }

    /// Device address of a chunk: region base plus chunk start.
    #[inline]
    pub fn address(&self, id: ChunkId) -> Result<u64, AllocError> {
        let chunk = self.chunk(id)?;
        Ok(self.base + chunk.start as u64)
    }

    /// Iterates chunks in address order.
    pub fn iter(&self) -> impl Iterator<Item = Chunk> + '_ {
        let mut cursor = Some(self.head);
        std::iter::from_fn(move || {
            let node = self.node(cursor?);
            cursor = node.next;
            Some(node.chunk)
        })
    }

    #[inline]
    pub fn chunks(&self) -> Vec<Chunk> {
        self.iter().collect()
    }

    pub fn free_bytes(&self) -> usize {
        self.iter()
            .filter(|chunk| !chunk.in_use)
            .map(|chunk| chunk.size)
            .sum()
    }

    pub fn largest_free(&self) -> usize {
        self.iter()
            .filter(|chunk| !chunk.in_use)
            .map(|chunk| chunk.size)
            .max()
            .unwrap_or_default()
    }

    /// Prints the region's chunk list in a human-readable format.
    pub fn print_pretty(&self) -> String {
        self.iter()
            .map(|chunk| {
                let state = if chunk.in_use { "used" } else { "free" };
                let start = self.base + chunk.start as u64;
                let end = self.base + chunk.end() as u64;
                format!("{start:#010x}..{end:#010x}\t{state}\t{}", chunk.size)
            })
            .join("\n")
    }
}

impl std::fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.print_pretty())
    }
}
