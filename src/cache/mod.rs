mod arena;
mod backindex;
mod current;
mod evicter;
mod page;
mod pagecache;
mod sync;
mod txn;

pub use pagecache::{CacheConn, CacheError, CacheStats, CacheTxn, PageAcq, PageCache};
pub use page::{PageReadGuard, PageWriteGuard};
pub use txn::FlushError;

/// Access mode of a block acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// Per-block monotonically increasing counter distinguishing successive
/// write acquisitions. Readers observe the version of the last writer
/// ahead of them; each new writer gets a strictly greater version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockVersion(u64);

impl BlockVersion {
    pub const ZERO: BlockVersion = BlockVersion(0);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}
