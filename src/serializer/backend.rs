use thiserror::Error;

/// Stable logical identifier for one fixed-size unit of storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    pub fn new(block_id: u32) -> Self {
        Self(block_id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

/// Opaque handle to the current durable location of a block's bytes.
///
/// Tokens stay readable for as long as the serializer instance lives;
/// a new write to the same block id yields a new token and never
/// invalidates an old one that a snapshot may still load from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockToken(u64);

impl BlockToken {
    pub fn new(token: u64) -> Self {
        Self(token)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Logical timestamp of the most recent modification to a block,
/// independent of physical page identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Recency(u64);

impl Recency {
    pub fn new(recency: u64) -> Self {
        Self(recency)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Priority of an I/O account; higher values are served first by
/// serializers that maintain prioritized queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct IoPriority(pub i32);

impl IoPriority {
    /// Demand reads block a waiting caller and jump the queue.
    pub const READS: IoPriority = IoPriority(100);
    /// Writebacks happen in the background.
    pub const WRITES: IoPriority = IoPriority(0);
}

/// Selects which prioritized I/O queue a read is accounted against.
#[derive(Clone, Copy, Debug)]
pub struct CacheAccount {
    priority: IoPriority,
}

impl CacheAccount {
    pub(crate) fn new(priority: IoPriority) -> Self {
        Self { priority }
    }

    pub fn priority(&self) -> IoPriority {
        self.priority
    }
}

/// The durable state the serializer holds for a block id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub token: BlockToken,
    pub recency: Recency,
}

/// One entry of a batched flush.
#[derive(Debug)]
pub enum WritePayload {
    /// Durably replace the block's bytes.
    Modify(Vec<u8>),
    /// Recency-only update; the block's bytes are unchanged.
    Touch,
    /// Drop the block from the index.
    Delete,
}

#[derive(Debug)]
pub struct BufferWrite {
    pub block_id: BlockId,
    pub payload: WritePayload,
    pub recency: Recency,
}

#[derive(Error, Debug)]
pub enum SerializerError {
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("unknown block token")]
    BadToken,
    #[error("block larger than max block size")]
    OversizedBlock,
    #[error("serializer file corrupted")]
    FileCorrupted,
}

/// The on-disk serializer the cache writes through.
///
/// The cache is the only caller and never retries: a failed read or
/// write is either fatal (loads) or surfaced to the transactions whose
/// flush it was (writes).
pub trait Serializer: Send + Sync {
    /// Fetch the latest durable token and recency for a block id, or
    /// `None` if the block has never been written (or was deleted).
    fn index_read(&self, block_id: BlockId) -> Result<Option<IndexEntry>, SerializerError>;

    /// Fetch the bytes a token points at. `account` selects the
    /// prioritized read queue.
    fn block_read(
        &self,
        token: BlockToken,
        account: &CacheAccount,
    ) -> Result<Vec<u8>, SerializerError>;

    /// Durably write one batch of block changes. Returns, in input
    /// order, the new token for every `Modify` payload and `None` for
    /// `Touch`/`Delete` entries. The whole batch commits atomically
    /// with respect to recovery.
    fn block_write(
        &self,
        writes: Vec<BufferWrite>,
    ) -> Result<Vec<Option<BlockToken>>, SerializerError>;

    /// Fixed block size for this serializer instance.
    fn max_block_size(&self) -> usize;

    /// One past the highest block id ever written; seeds the cache's
    /// block id allocator.
    fn end_block_id(&self) -> BlockId;
}
