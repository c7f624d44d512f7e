use crate::serializer::{
    BlockId, BlockToken, BufferWrite, CacheAccount, IndexEntry, Recency, Serializer,
    SerializerError, WritePayload,
};

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

const MAGIC: &[u8; 8] = b"CACHETTE";
const FILE_HEADER_LEN: u64 = 12;
const RECORD_HEADER_LEN: u64 = 17;

const KIND_MODIFY: u8 = 0;
const KIND_TOUCH: u8 = 1;
const KIND_DELETE: u8 = 2;

struct FileInner {
    index: HashMap<BlockId, IndexEntry>,
    end_offset: u64,
    end_block_id: u32,
}

/// Append-only log serializer.
///
/// Every flush batch appends one record per block change and fsyncs
/// once; a block token is the file offset of the record that last
/// modified the block. Old records are never overwritten, so tokens
/// held by snapshotted pages stay readable. The index is rebuilt by
/// scanning the log on open.
pub struct FileSerializer {
    file: File,
    inner: parking_lot::Mutex<FileInner>,
    block_size: usize,
}

impl FileSerializer {
    pub fn create<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self, SerializerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let mut header = [0u8; FILE_HEADER_LEN as usize];
        header[..8].copy_from_slice(MAGIC);
        LittleEndian::write_u32(&mut header[8..12], block_size as u32);
        file.write_all_at(&header, 0)?;
        file.sync_all()?;

        Ok(Self {
            file,
            inner: parking_lot::Mutex::new(FileInner {
                index: HashMap::new(),
                end_offset: FILE_HEADER_LEN,
                end_block_id: 0,
            }),
            block_size,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SerializerError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < FILE_HEADER_LEN {
            return Err(SerializerError::FileCorrupted);
        }

        let mut header = [0u8; FILE_HEADER_LEN as usize];
        file.read_exact_at(&mut header, 0)?;
        if &header[..8] != MAGIC {
            return Err(SerializerError::FileCorrupted);
        }
        let block_size = LittleEndian::read_u32(&header[8..12]) as usize;

        // replay the log to rebuild the index
        let mut index = HashMap::new();
        let mut end_block_id = 0u32;
        let mut offset = FILE_HEADER_LEN;
        while offset < len {
            if offset + RECORD_HEADER_LEN > len {
                return Err(SerializerError::FileCorrupted);
            }
            let mut record_header = [0u8; RECORD_HEADER_LEN as usize];
            file.read_exact_at(&mut record_header, offset)?;
            let block_id = BlockId::new(LittleEndian::read_u32(&record_header[0..4]));
            let kind = record_header[4];
            let data_len = LittleEndian::read_u32(&record_header[5..9]) as u64;
            let recency = Recency::new(LittleEndian::read_u64(&record_header[9..17]));
            if offset + RECORD_HEADER_LEN + data_len > len {
                return Err(SerializerError::FileCorrupted);
            }

            end_block_id = end_block_id.max(block_id.get() + 1);
            match kind {
                KIND_MODIFY => {
                    index.insert(block_id, IndexEntry {
                        token: BlockToken::new(offset),
                        recency,
                    });
                }
                KIND_TOUCH => {
                    if let Some(entry) = index.get_mut(&block_id) {
                        entry.recency = recency;
                    }
                }
                KIND_DELETE => {
                    index.remove(&block_id);
                }
                _ => return Err(SerializerError::FileCorrupted),
            }
            offset += RECORD_HEADER_LEN + data_len;
        }

        Ok(Self {
            file,
            inner: parking_lot::Mutex::new(FileInner {
                index,
                end_offset: len,
                end_block_id,
            }),
            block_size,
        })
    }

    fn fsync(&self) {
        let result = self.file.sync_all();
        if result.is_err() {
            // if fsync fails, we can't make sure data is flushed to disk
            // ref: https://wiki.postgresql.org/wiki/Fsync_Errors
            panic!("flush (fsync) failed");
        }
    }
}

impl Serializer for FileSerializer {
    fn index_read(&self, block_id: BlockId) -> Result<Option<IndexEntry>, SerializerError> {
        Ok(self.inner.lock().index.get(&block_id).copied())
    }

    fn block_read(
        &self,
        token: BlockToken,
        _account: &CacheAccount,
    ) -> Result<Vec<u8>, SerializerError> {
        let offset = token.get();
        let mut record_header = [0u8; RECORD_HEADER_LEN as usize];
        self.file.read_exact_at(&mut record_header, offset)?;
        if record_header[4] != KIND_MODIFY {
            return Err(SerializerError::BadToken);
        }
        let data_len = LittleEndian::read_u32(&record_header[5..9]) as usize;

        let mut bytes = vec![0u8; data_len];
        self.file
            .read_exact_at(&mut bytes, offset + RECORD_HEADER_LEN)?;
        Ok(bytes)
    }

    fn block_write(
        &self,
        writes: Vec<BufferWrite>,
    ) -> Result<Vec<Option<BlockToken>>, SerializerError> {
        let mut inner = self.inner.lock();

        let mut batch = Vec::new();
        let mut tokens = Vec::with_capacity(writes.len());
        let mut offset = inner.end_offset;
        for write in &writes {
            let (kind, data): (u8, &[u8]) = match &write.payload {
                WritePayload::Modify(bytes) => {
                    if bytes.len() > self.block_size {
                        return Err(SerializerError::OversizedBlock);
                    }
                    (KIND_MODIFY, bytes)
                }
                WritePayload::Touch => (KIND_TOUCH, &[]),
                WritePayload::Delete => (KIND_DELETE, &[]),
            };

            let mut record_header = [0u8; RECORD_HEADER_LEN as usize];
            LittleEndian::write_u32(&mut record_header[0..4], write.block_id.get());
            record_header[4] = kind;
            LittleEndian::write_u32(&mut record_header[5..9], data.len() as u32);
            LittleEndian::write_u64(&mut record_header[9..17], write.recency.get());
            batch.extend_from_slice(&record_header);
            batch.extend_from_slice(data);

            tokens.push((kind == KIND_MODIFY).then_some(BlockToken::new(offset)));
            offset += RECORD_HEADER_LEN + data.len() as u64;
        }

        self.file.write_all_at(&batch, inner.end_offset)?;
        self.fsync();

        inner.end_offset = offset;
        for (write, token) in writes.iter().zip(&tokens) {
            inner.end_block_id = inner.end_block_id.max(write.block_id.get() + 1);
            match write.payload {
                WritePayload::Modify(_) => {
                    inner.index.insert(write.block_id, IndexEntry {
                        token: token.expect("modify writes get a token"),
                        recency: write.recency,
                    });
                }
                WritePayload::Touch => {
                    if let Some(entry) = inner.index.get_mut(&write.block_id) {
                        entry.recency = write.recency;
                    }
                }
                WritePayload::Delete => {
                    inner.index.remove(&write.block_id);
                }
            }
        }
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

    use tempfile::NamedTempFile;

    fn account() -> CacheAccount {
        CacheAccount::new(crate::serializer::IoPriority::READS)
    }

    #[test]
    fn write_read_roundtrip() {
        let tmp = NamedTempFile::new().unwrap();
        let serializer = FileSerializer::create(tmp.path(), 4096).unwrap();

        let tokens = serializer
            .block_write(vec![
                BufferWrite {
                    block_id: BlockId::new(0),
                    payload: WritePayload::Modify(vec![0x11; 32]),
                    recency: Recency::new(1),
                },
                BufferWrite {
                    block_id: BlockId::new(1),
                    payload: WritePayload::Modify(vec![0x22; 64]),
                    recency: Recency::new(2),
                },
            ])
            .unwrap();

        assert_eq!(
            serializer.block_read(tokens[0].unwrap(), &account()).unwrap(),
            vec![0x11; 32]
        );
        assert_eq!(
            serializer.block_read(tokens[1].unwrap(), &account()).unwrap(),
            vec![0x22; 64]
        );
        assert_eq!(serializer.end_block_id(), BlockId::new(2));
    }

    #[test]
    fn reopen_rebuilds_index() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let serializer = FileSerializer::create(tmp.path(), 4096).unwrap();
            serializer
                .block_write(vec![
                    BufferWrite {
                        block_id: BlockId::new(0),
                        payload: WritePayload::Modify(vec![1, 2, 3]),
                        recency: Recency::new(1),
                    },
                    BufferWrite {
                        block_id: BlockId::new(1),
                        payload: WritePayload::Modify(vec![4, 5]),
                        recency: Recency::new(2),
                    },
                ])
                .unwrap();
            serializer
                .block_write(vec![
                    BufferWrite {
                        block_id: BlockId::new(0),
                        payload: WritePayload::Modify(vec![7, 7, 7]),
                        recency: Recency::new(3),
                    },
                    BufferWrite {
                        block_id: BlockId::new(1),
                        payload: WritePayload::Delete,
                        recency: Recency::new(4),
                    },
                ])
                .unwrap();
        }

        let serializer = FileSerializer::open(tmp.path()).unwrap();
        assert_eq!(serializer.max_block_size(), 4096);
        assert_eq!(serializer.end_block_id(), BlockId::new(2));
        assert!(serializer.index_read(BlockId::new(1)).unwrap().is_none());

        let entry = serializer.index_read(BlockId::new(0)).unwrap().unwrap();
        assert_eq!(entry.recency, Recency::new(3));
        assert_eq!(serializer.block_read(entry.token, &account()).unwrap(), vec![
            7, 7, 7
        ]);
    }

    #[test]
    fn old_tokens_stay_readable_after_rewrite() {
        let tmp = NamedTempFile::new().unwrap();
        let serializer = FileSerializer::create(tmp.path(), 4096).unwrap();

        let t1 = serializer
            .block_write(vec![BufferWrite {
                block_id: BlockId::new(0),
                payload: WritePayload::Modify(vec![1]),
                recency: Recency::new(1),
            }])
            .unwrap()[0]
            .unwrap();
        serializer
            .block_write(vec![BufferWrite {
                block_id: BlockId::new(0),
                payload: WritePayload::Modify(vec![2]),
                recency: Recency::new(2),
            }])
            .unwrap();

        assert_eq!(serializer.block_read(t1, &account()).unwrap(), vec![1]);
    }

    #[test]
    fn open_rejects_garbage() {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"not a cachette log at all").unwrap();
        assert!(matches!(
            FileSerializer::open(tmp.path()),
            Err(SerializerError::FileCorrupted)
        ));
    }
}
