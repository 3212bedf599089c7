//! Pure helpers that turn a queue name and shard index into the Redis keys
//! actually used on the wire. Kept side-effect free so they can be unit
//! tested without a running server.

/// The hash-tagged stream key for a given shard of a queue.
///
/// The `{shard}` hash tag guarantees every key for a shard lands on the
/// same cluster slot, which is what lets a single XADD/XREADGROUP/XACK
/// pipeline stay on one node.
pub fn shard_stream(name: &str, shard: u32) -> String {
    format!("qu{{{shard}}}_{name}")
}

/// The consumer-group name shared by every consumer of a queue.
pub fn group_name(name: &str) -> String {
    format!("qu_{name}_group")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_stream_hash_tags_the_shard() {
        assert_eq!(shard_stream("orders", 3), "qu{3}_orders");
        assert_eq!(shard_stream("orders", 0), "qu{0}_orders");
    }

    #[test]
    fn distinct_shards_distinct_keys() {
        assert_ne!(shard_stream("orders", 1), shard_stream("orders", 2));
    }

    #[test]
    fn group_name_is_stable_for_a_queue() {
        assert_eq!(group_name("orders"), "qu_orders_group");
        assert_eq!(group_name("orders"), group_name("orders"));
    }
}
