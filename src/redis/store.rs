use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use crate::config::MIN_STORE_TIMEOUT;
use crate::error::{AmiError, AmiResult};
use crate::naming::{group_name, shard_stream};

/// A cloneable handle to the backing stream store. [`ConnectionManager`] is itself cheaply
/// cloneable and reconnects transparently, which is what lets every shard reader/writer task
/// hold its own copy without a pool.
#[derive(Clone)]
pub struct Store {
    conn: ConnectionManager,
}

impl Store {
    /// Opens a connection, normalizing `response_timeout`/`connection_timeout` up to
    /// [`MIN_STORE_TIMEOUT`] because large pipelined batches need generous round-trip budgets.
    pub async fn connect(redis_url: &str) -> AmiResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(MIN_STORE_TIMEOUT)
            .set_response_timeout(MIN_STORE_TIMEOUT);
        let conn = ConnectionManager::new_with_config(client, config).await?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub(crate) fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Ensures every shard-stream `qu{i}_<name>` exists and has group `qu_<name>_group`.
    /// Idempotent and safe under concurrent bootstrappers: a `BUSYGROUP` response from a racing
    /// `XGROUP CREATE` is treated as success, not an error.
    pub async fn ensure_shards(&self, name: &str, shards_count: u32) -> AmiResult<()> {
        let group = group_name(name);
        for shard in 0..shards_count {
            let stream = shard_stream(name, shard);
            self.ensure_shard(&stream, &group).await?;
        }
        Ok(())
    }

    async fn ensure_shard(&self, stream: &str, group: &str) -> AmiResult<()> {
        let mut conn = self.conn.clone();

        if xinfo_stream(&mut conn, stream).await.is_err() {
            let create: redis::RedisResult<String> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(stream)
                .arg(group)
                .arg("$")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;

            if let Err(e) = create {
                if !e.to_string().contains("BUSYGROUP") {
                    return Err(AmiError::Bootstrap(format!(
                        "XGROUP CREATE {stream} {group}: {e}"
                    )));
                }
            }
        }

        xinfo_stream(&mut conn, stream)
            .await
            .map_err(|e| AmiError::Bootstrap(format!("XINFO STREAM {stream}: {e}")))?;

        Ok(())
    }

    /// Pipelines one `XADD <stream> * m <body>` per element of `bodies` inside a single
    /// transaction.
    pub async fn xadd_batch(&self, stream: &str, bodies: &[String]) -> AmiResult<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for body in bodies {
            pipe.cmd("XADD").arg(stream).arg("*").arg("m").arg(body);
        }
        let _: Vec<String> = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Issues a single `XREADGROUP` for one shard-stream at the given cursor. `block` of `None`
    /// omits the `BLOCK` clause entirely (no blocking); `Some(ms)` blocks for that many
    /// milliseconds.
    pub async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        id: &str,
        count: i64,
        block: Option<i64>,
    ) -> AmiResult<StreamReadReply> {
        let mut conn = self.conn.clone();
        let mut opts = StreamReadOptions::default().group(group, consumer).count(count as usize);
        if let Some(ms) = block {
            opts = opts.block(ms as usize);
        }
        let reply: StreamReadReply = conn.xread_options(&[stream], &[id], &opts).await?;
        Ok(reply)
    }

    /// Pipelines `XACK stream group id` + `XDEL stream id` for every id, inside one transaction.
    pub async fn xack_xdel_batch(&self, stream: &str, group: &str, ids: &[String]) -> AmiResult<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in ids {
            pipe.cmd("XACK").arg(stream).arg(group).arg(id);
            pipe.cmd("XDEL").arg(stream).arg(id);
        }
        let _: redis::Value = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Acks and deletes a single malformed entry so it doesn't stall the backlog cursor.
    pub async fn self_ack(&self, stream: &str, group: &str, id: &str) -> AmiResult<()> {
        self.xack_xdel_batch(stream, group, std::slice::from_ref(&id.to_string()))
            .await
    }
}

async fn xinfo_stream(conn: &mut ConnectionManager, stream: &str) -> redis::RedisResult<redis::Value> {
    redis::cmd("XINFO").arg("STREAM").arg(stream).query_async(conn).await
}
