//! Configuration of the replication queue.

/// Tunables of a [`ReplicationQueue`](crate::queue::ReplicationQueue).
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Number of coordinator ops batched into one atomic multi-request while
    /// pulling log entries. Coordinators cap the total size of a
    /// multi-request (commonly around 1 MiB); with typical entry bodies well
    /// under 10 KiB the default keeps a comfortable margin.
    pub pull_batch_size: usize,

    /// The merge executor's size ceiling when its pool is completely free.
    /// When the executor reports a smaller ceiling, oversized merges are
    /// postponed so the remaining capacity serves small ones; when it
    /// reports exactly this value, any size is admitted.
    pub max_bytes_to_merge_at_max_space_in_pool: u64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            pull_batch_size: 100,
            max_bytes_to_merge_at_max_space_in_pool: 150 * 1024 * 1024 * 1024,
        }
    }
}
