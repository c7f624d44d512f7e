use crate::serializer::IoPriority;

/// Default memory budget for resident page buffers.
pub const DEFAULT_MEMORY_LIMIT: usize = 16 * 1024 * 1024;

/// Default number of background loader threads.
pub const DEFAULT_LOADER_THREADS: usize = 2;

/// Default per-connection bound on outstanding unflushed block changes
/// (dirty pages plus one index write per transaction).
pub const DEFAULT_THROTTLER_LIMIT: u64 = 64;

pub struct CacheConfig {
    /// Total bytes of page buffers the cache may keep resident before
    /// evicting disk-backed pages.
    pub memory_limit: usize,
    pub loader_threads: usize,
    pub throttler_limit: u64,
    /// I/O priority used for demand loads.
    pub read_priority: IoPriority,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_limit: DEFAULT_MEMORY_LIMIT,
            loader_threads: DEFAULT_LOADER_THREADS,
            throttler_limit: DEFAULT_THROTTLER_LIMIT,
            read_priority: IoPriority::READS,
        }
    }
}
