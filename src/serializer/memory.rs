use crate::serializer::{
    BlockId, BlockToken, BufferWrite, CacheAccount, IndexEntry, Recency, Serializer,
    SerializerError, WritePayload,
};

use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(Default)]
struct MemInner {
    /// token -> (block id, bytes). Old tokens stay readable so that
    /// snapshotted pages can reload after eviction.
    blocks: HashMap<u64, (BlockId, Vec<u8>)>,
    index: HashMap<BlockId, IndexEntry>,
    next_token: u64,
    end_block_id: u32,
    // test instrumentation
    write_batches: Vec<Vec<BlockId>>,
    block_reads: HashMap<BlockId, usize>,
    last_read_priority: Option<i32>,
    fail_next_write: bool,
}

/// In-memory serializer used by tests and benches.
///
/// Records every write batch and per-block read counts so tests can
/// assert on flush batching and cache hit/miss behaviour.
pub struct MemSerializer {
    inner: Mutex<MemInner>,
    block_size: usize,
}

impl MemSerializer {
    pub fn new(block_size: usize) -> Self {
        Self {
            inner: Mutex::new(MemInner::default()),
            block_size,
        }
    }

    /// Block ids of every `block_write` batch so far, in commit order.
    pub fn write_batches(&self) -> Vec<Vec<BlockId>> {
        self.inner.lock().write_batches.clone()
    }

    /// How many times a block's bytes were read back.
    pub fn reads_for_block(&self, block_id: BlockId) -> usize {
        self.inner
            .lock()
            .block_reads
            .get(&block_id)
            .copied()
            .unwrap_or(0)
    }

    /// Latest durable bytes for a block id, if any.
    pub fn contents_for_block(&self, block_id: BlockId) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        let entry = inner.index.get(&block_id)?;
        inner
            .blocks
            .get(&entry.token.get())
            .map(|(_, bytes)| bytes.clone())
    }

    /// Latest durable recency for a block id, if any.
    pub fn recency_for_block(&self, block_id: BlockId) -> Option<Recency> {
        self.inner.lock().index.get(&block_id).map(|e| e.recency)
    }

    pub fn last_read_priority(&self) -> Option<i32> {
        self.inner.lock().last_read_priority
    }

    /// Make the next `block_write` fail with an injected I/O error.
    pub fn fail_next_write(&self) {
        self.inner.lock().fail_next_write = true;
    }
}

impl Serializer for MemSerializer {
    fn index_read(&self, block_id: BlockId) -> Result<Option<IndexEntry>, SerializerError> {
        Ok(self.inner.lock().index.get(&block_id).copied())
    }

    fn block_read(
        &self,
        token: BlockToken,
        account: &CacheAccount,
    ) -> Result<Vec<u8>, SerializerError> {
        let mut inner = self.inner.lock();
        inner.last_read_priority = Some(account.priority().0);
        let (block_id, bytes) = inner
            .blocks
            .get(&token.get())
            .cloned()
            .ok_or(SerializerError::BadToken)?;
        *inner.block_reads.entry(block_id).or_insert(0) += 1;
        Ok(bytes)
    }

    fn block_write(
        &self,
        writes: Vec<BufferWrite>,
    ) -> Result<Vec<Option<BlockToken>>, SerializerError> {
        let mut inner = self.inner.lock();
        if inner.fail_next_write {
            inner.fail_next_write = false;
            return Err(SerializerError::Io(std::io::Error::other(
                "injected write failure",
            )));
        }

        let mut tokens = Vec::with_capacity(writes.len());
        let mut batch = Vec::with_capacity(writes.len());
        for write in writes {
            batch.push(write.block_id);
            inner.end_block_id = inner.end_block_id.max(write.block_id.get() + 1);
            match write.payload {
                WritePayload::Modify(bytes) => {
                    if bytes.len() > self.block_size {
                        return Err(SerializerError::OversizedBlock);
                    }
                    let token = BlockToken::new(inner.next_token);
                    inner.next_token += 1;
                    inner.blocks.insert(token.get(), (write.block_id, bytes));
                    inner.index.insert(
                        write.block_id,
                        IndexEntry {
                            token,
                            recency: write.recency,
                        },
                    );
                    tokens.push(Some(token));
                }
                WritePayload::Touch => {
                    if let Some(entry) = inner.index.get_mut(&write.block_id) {
                        entry.recency = write.recency;
                    }
                    tokens.push(None);
                }
                WritePayload::Delete => {
                    inner.index.remove(&write.block_id);
                    tokens.push(None);
                }
            }
        }
        inner.write_batches.push(batch);
        Ok(tokens)
    }

    fn max_block_size(&self) -> usize {
        self.block_size
    }

    fn end_block_id(&self) -> BlockId {
        BlockId::new(self.inner.lock().end_block_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> CacheAccount {
        CacheAccount::new(crate::serializer::IoPriority::READS)
    }

    #[test]
    fn write_then_read_back() {
        let serializer = MemSerializer::new(4096);
        let tokens = serializer
            .block_write(vec![BufferWrite {
                block_id: BlockId::new(3),
                payload: WritePayload::Modify(vec![0xAB; 16]),
                recency: Recency::new(1),
            }])
            .unwrap();
        let token = tokens[0].unwrap();

        let entry = serializer.index_read(BlockId::new(3)).unwrap().unwrap();
        assert_eq!(entry.token, token);
        assert_eq!(entry.recency, Recency::new(1));
        assert_eq!(serializer.block_read(token, &account()).unwrap(), vec![
            0xAB;
            16
        ]);
        assert_eq!(serializer.end_block_id(), BlockId::new(4));
    }

    #[test]
    fn old_tokens_stay_readable() {
        let serializer = MemSerializer::new(4096);
        let t1 = serializer
            .block_write(vec![BufferWrite {
                block_id: BlockId::new(0),
                payload: WritePayload::Modify(vec![1]),
                recency: Recency::new(1),
            }])
            .unwrap()[0]
            .unwrap();
        let t2 = serializer
            .block_write(vec![BufferWrite {
                block_id: BlockId::new(0),
                payload: WritePayload::Modify(vec![2]),
                recency: Recency::new(2),
            }])
            .unwrap()[0]
            .unwrap();

        assert_eq!(serializer.block_read(t1, &account()).unwrap(), vec![1]);
        assert_eq!(serializer.block_read(t2, &account()).unwrap(), vec![2]);
    }

    #[test]
    fn delete_removes_index_entry() {
        let serializer = MemSerializer::new(4096);
        serializer
            .block_write(vec![BufferWrite {
                block_id: BlockId::new(7),
                payload: WritePayload::Modify(vec![9]),
                recency: Recency::new(1),
            }])
            .unwrap();
        serializer
            .block_write(vec![BufferWrite {
                block_id: BlockId::new(7),
                payload: WritePayload::Delete,
                recency: Recency::new(2),
            }])
            .unwrap();
        assert!(serializer.index_read(BlockId::new(7)).unwrap().is_none());
    }

    #[test]
    fn touch_updates_recency_only() {
        let serializer = MemSerializer::new(4096);
        let token = serializer
            .block_write(vec![BufferWrite {
                block_id: BlockId::new(1),
                payload: WritePayload::Modify(vec![5]),
                recency: Recency::new(1),
            }])
            .unwrap()[0]
            .unwrap();
        serializer
            .block_write(vec![BufferWrite {
                block_id: BlockId::new(1),
                payload: WritePayload::Touch,
                recency: Recency::new(9),
            }])
            .unwrap();

        let entry = serializer.index_read(BlockId::new(1)).unwrap().unwrap();
        assert_eq!(entry.token, token);
        assert_eq!(entry.recency, Recency::new(9));
    }

    #[test]
    fn injected_write_failure() {
        let serializer = MemSerializer::new(4096);
        serializer.fail_next_write();
        let result = serializer.block_write(vec![BufferWrite {
            block_id: BlockId::new(0),
            payload: WritePayload::Modify(vec![0]),
            recency: Recency::new(1),
        }]);
        assert!(result.is_err());
        // the failure is one-shot
        assert!(
            serializer
                .block_write(vec![BufferWrite {
                    block_id: BlockId::new(0),
                    payload: WritePayload::Modify(vec![0]),
                    recency: Recency::new(1),
                }])
                .is_ok()
        );
    }
}
