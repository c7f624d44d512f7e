mod backend;
mod file;
mod memory;

pub use backend::{
    BlockId, BlockToken, BufferWrite, CacheAccount, IndexEntry, IoPriority, Recency, Serializer,
    SerializerError, WritePayload,
};
pub use file::FileSerializer;
pub use memory::MemSerializer;
