use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use classroom_store::{
    Command, EntryId, ReadBatch, Reply, SetCondition, Store, StoreError, StoreMode, StreamEntry,
    StreamReader,
};
use redis::aio::{ConnectionLike, ConnectionManager, MultiplexedConnection};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::streams::{StreamId, StreamRangeReply, StreamReadReply};
use tracing::{info, warn};

/// Slack on top of the long-poll window before a cluster reply counts as lost.
const RESPONSE_SLACK: Duration = Duration::from_secs(5);

/// Redis-backed [`Store`]. Whether the deployment is a single node or a cluster is
/// decided once in [`RedisStore::connect`].
pub struct RedisStore {
    connection: RedisConnection,
}

#[derive(Clone)]
enum RedisConnection {
    Single {
        client: redis::Client,
        manager: ConnectionManager,
    },
    Cluster {
        client: ClusterClient,
        connection: ClusterConnection,
    },
}

impl RedisStore {
    /// Connect to `url`, or to the cluster seeded by `cluster_nodes` when given. A single
    /// URL that turns out to be a cluster member is reconnected through the cluster client.
    pub async fn connect(
        url: &str,
        cluster_nodes: &[String],
        block_timeout: Duration,
    ) -> Result<Self, StoreError> {
        if !cluster_nodes.is_empty() {
            return Self::connect_cluster(cluster_nodes.to_vec(), block_timeout).await;
        }

        let client = redis::Client::open(url).map_err(backend)?;
        let mut manager = client.get_connection_manager().await.map_err(backend)?;
        if cluster_enabled(&mut manager).await {
            info!(%url, "redis reports cluster mode; switching to cluster client");
            return Self::connect_cluster(vec![url.to_string()], block_timeout).await;
        }
        info!(%url, "connected to single-node redis");
        Ok(Self {
            connection: RedisConnection::Single { client, manager },
        })
    }

    async fn connect_cluster(nodes: Vec<String>, block_timeout: Duration) -> Result<Self, StoreError> {
        let node_count = nodes.len();
        let client = ClusterClient::builder(nodes)
            .response_timeout(block_timeout + RESPONSE_SLACK)
            .build()
            .map_err(backend)?;
        let connection = client.get_async_connection().await.map_err(backend)?;
        info!(seeds = node_count, "connected to redis cluster");
        Ok(Self {
            connection: RedisConnection::Cluster { client, connection },
        })
    }
}

async fn cluster_enabled(conn: &mut ConnectionManager) -> bool {
    let info: Result<String, _> = redis::cmd("INFO").arg("cluster").query_async(conn).await;
    match info {
        Ok(info) => info.lines().any(|line| line.trim() == "cluster_enabled:1"),
        Err(err) => {
            warn!(error = %err, "INFO cluster failed; assuming single node");
            false
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    fn mode(&self) -> StoreMode {
        match self.connection {
            RedisConnection::Single { .. } => StoreMode::Single,
            RedisConnection::Cluster { .. } => StoreMode::Cluster,
        }
    }

    async fn execute(&self, command: Command) -> Result<Reply, StoreError> {
        match self.connection.clone() {
            RedisConnection::Single { mut manager, .. } => run(&mut manager, &command).await,
            RedisConnection::Cluster { mut connection, .. } => run(&mut connection, &command).await,
        }
    }

    async fn execute_atomic(&self, commands: Vec<Command>) -> Vec<Result<Reply, StoreError>> {
        match self.connection.clone() {
            RedisConnection::Single { mut manager, .. } => {
                // MULTI/EXEC is spelled out so the EXEC reply arrives undecoded and a
                // command that failed inside the transaction fails on its own.
                let mut pipe = redis::pipe();
                pipe.cmd("MULTI");
                for command in &commands {
                    pipe.add_command(to_cmd(command));
                }
                pipe.cmd("EXEC");
                match manager
                    .req_packed_commands(&pipe, commands.len() + 1, 1)
                    .await
                {
                    Ok(mut replies) => match replies.pop() {
                        Some(exec) => exec_replies(&commands, exec),
                        None => failed_all(&commands, StoreError::Backend("EXEC sent no reply".into())),
                    },
                    Err(err) => failed_all(&commands, backend(err)),
                }
            }
            RedisConnection::Cluster { mut connection, .. } => {
                let mut results = Vec::with_capacity(commands.len());
                for command in &commands {
                    results.push(run(&mut connection, command).await);
                }
                results
            }
        }
    }

    async fn reader(&self) -> Result<Box<dyn StreamReader>, StoreError> {
        let connection = match &self.connection {
            RedisConnection::Single { client, .. } => ReaderConnection::Single(
                client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(backend)?,
            ),
            RedisConnection::Cluster { client, .. } => {
                ReaderConnection::Cluster(client.get_async_connection().await.map_err(backend)?)
            }
        };
        Ok(Box::new(RedisReader { connection }))
    }
}

enum ReaderConnection {
    Single(MultiplexedConnection),
    Cluster(ClusterConnection),
}

/// Owns a connection nobody else writes on, so `XREAD BLOCK` stalls only this reader.
struct RedisReader {
    connection: ReaderConnection,
}

#[async_trait]
impl StreamReader for RedisReader {
    async fn read(
        &mut self,
        cursors: &[(String, EntryId)],
        count: usize,
        block: Duration,
    ) -> Result<ReadBatch, StoreError> {
        let mut cmd = redis::cmd("XREAD");
        cmd.arg("COUNT").arg(count);
        if !block.is_zero() {
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS");
        for (key, _) in cursors {
            cmd.arg(key);
        }
        for (_, id) in cursors {
            cmd.arg(id.to_string());
        }

        let value: redis::Value = match &mut self.connection {
            ReaderConnection::Single(conn) => cmd.query_async(conn).await,
            ReaderConnection::Cluster(conn) => cmd.query_async(conn).await,
        }
        .map_err(backend)?;
        if matches!(value, redis::Value::Nil) {
            return Ok(Vec::new());
        }

        let reply: StreamReadReply = redis::from_redis_value(&value).map_err(backend)?;
        let mut batch = Vec::with_capacity(reply.keys.len());
        for stream in reply.keys {
            let entries = stream
                .ids
                .into_iter()
                .map(to_entry)
                .collect::<Result<Vec<_>, _>>()?;
            if !entries.is_empty() {
                batch.push((stream.key, entries));
            }
        }
        Ok(batch)
    }

    async fn execute(&mut self, command: Command) -> Result<Reply, StoreError> {
        match &mut self.connection {
            ReaderConnection::Single(conn) => run(conn, &command).await,
            ReaderConnection::Cluster(conn) => run(conn, &command).await,
        }
    }
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn failed_all(commands: &[Command], err: StoreError) -> Vec<Result<Reply, StoreError>> {
    commands.iter().map(|_| Err(err.clone())).collect()
}

/// Split an EXEC reply into one result per queued command. Redis applies the commands
/// that succeed even when others fail, so errors stay with their own command.
fn exec_replies(commands: &[Command], exec: redis::Value) -> Vec<Result<Reply, StoreError>> {
    match exec {
        redis::Value::Array(values) if values.len() == commands.len() => commands
            .iter()
            .zip(values)
            .map(|(command, value)| decode(command, value))
            .collect(),
        redis::Value::Array(values) => failed_all(
            commands,
            StoreError::Backend(format!(
                "EXEC returned {} replies for {} commands",
                values.len(),
                commands.len()
            )),
        ),
        redis::Value::Nil => failed_all(commands, StoreError::Backend("transaction aborted".into())),
        redis::Value::ServerError(err) => failed_all(commands, backend(err.into())),
        other => failed_all(
            commands,
            StoreError::Backend(format!("unexpected EXEC reply: {other:?}")),
        ),
    }
}

const DEL_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const TAKE_MEMBERS: &str = r#"
local members = redis.call('SMEMBERS', KEYS[1])
redis.call('DEL', KEYS[1])
return members
"#;

fn eval(script: &str, key: &str) -> redis::Cmd {
    let mut cmd = redis::cmd("EVAL");
    cmd.arg(script).arg(1).arg(key);
    cmd
}

async fn run<C>(conn: &mut C, command: &Command) -> Result<Reply, StoreError>
where
    C: ConnectionLike + Send,
{
    let value: redis::Value = to_cmd(command).query_async(conn).await.map_err(backend)?;
    decode(command, value)
}

fn to_cmd(command: &Command) -> redis::Cmd {
    match command {
        Command::Get { key } => {
            let mut cmd = redis::cmd("GET");
            cmd.arg(key);
            cmd
        }
        Command::Set {
            key,
            value,
            ttl,
            condition,
        } => {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl.as_millis() as u64);
            }
            if *condition == SetCondition::IfAbsent {
                cmd.arg("NX");
            }
            cmd
        }
        Command::Swap { key, value, ttl } => {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl.as_millis() as u64);
            }
            cmd.arg("GET");
            cmd
        }
        Command::Del { key } => {
            let mut cmd = redis::cmd("DEL");
            cmd.arg(key);
            cmd
        }
        Command::DelIfEquals { key, value } => {
            let mut cmd = eval(DEL_IF_EQUALS, key);
            cmd.arg(value);
            cmd
        }
        Command::Expire { key, ttl } => {
            let mut cmd = redis::cmd("PEXPIRE");
            cmd.arg(key).arg(ttl.as_millis() as u64);
            cmd
        }
        Command::HSet { key, fields } => {
            let mut cmd = redis::cmd("HSET");
            cmd.arg(key);
            for (field, value) in fields {
                cmd.arg(field).arg(value);
            }
            cmd
        }
        Command::HGetAll { key } => {
            let mut cmd = redis::cmd("HGETALL");
            cmd.arg(key);
            cmd
        }
        Command::HIncrBy { key, field, delta } => {
            let mut cmd = redis::cmd("HINCRBY");
            cmd.arg(key).arg(field).arg(*delta);
            cmd
        }
        Command::SAdd { key, member } => {
            let mut cmd = redis::cmd("SADD");
            cmd.arg(key).arg(member);
            cmd
        }
        Command::SRem { key, member } => {
            let mut cmd = redis::cmd("SREM");
            cmd.arg(key).arg(member);
            cmd
        }
        Command::SMembers { key } => {
            let mut cmd = redis::cmd("SMEMBERS");
            cmd.arg(key);
            cmd
        }
        Command::TakeMembers { key } => eval(TAKE_MEMBERS, key),
        Command::ZAdd {
            key,
            member,
            score,
            only_new,
        } => {
            let mut cmd = redis::cmd("ZADD");
            cmd.arg(key);
            if *only_new {
                cmd.arg("NX");
            }
            cmd.arg(*score).arg(member);
            cmd
        }
        Command::ZRangeByScore { key, max } => {
            let mut cmd = redis::cmd("ZRANGEBYSCORE");
            cmd.arg(key).arg("-inf").arg(*max);
            cmd
        }
        Command::ZRem { key, member } => {
            let mut cmd = redis::cmd("ZREM");
            cmd.arg(key).arg(member);
            cmd
        }
        Command::XAdd {
            key,
            max_len,
            fields,
        } => {
            let mut cmd = redis::cmd("XADD");
            cmd.arg(key);
            if let Some(max_len) = max_len {
                cmd.arg("MAXLEN").arg("~").arg(*max_len);
            }
            cmd.arg("*");
            for (field, value) in fields {
                cmd.arg(field).arg(value);
            }
            cmd
        }
        Command::XLast { key } => {
            let mut cmd = redis::cmd("XREVRANGE");
            cmd.arg(key).arg("+").arg("-").arg("COUNT").arg(1);
            cmd
        }
        Command::Time => redis::cmd("TIME"),
    }
}

fn decode(command: &Command, value: redis::Value) -> Result<Reply, StoreError> {
    if let redis::Value::ServerError(err) = value {
        return Err(backend(err.into()));
    }
    let reply = match command {
        Command::Get { .. } | Command::Swap { .. } => {
            match redis::from_redis_value::<Option<String>>(&value).map_err(backend)? {
                Some(text) => Reply::Text(text),
                None => Reply::Nil,
            }
        }
        Command::Set { .. } => {
            match redis::from_redis_value::<Option<String>>(&value).map_err(backend)? {
                Some(_) => Reply::Ok,
                None => Reply::Nil,
            }
        }
        Command::Del { .. }
        | Command::DelIfEquals { .. }
        | Command::Expire { .. }
        | Command::HSet { .. }
        | Command::HIncrBy { .. }
        | Command::SAdd { .. }
        | Command::SRem { .. }
        | Command::ZAdd { .. }
        | Command::ZRem { .. } => Reply::Int(redis::from_redis_value(&value).map_err(backend)?),
        Command::HGetAll { .. } => {
            let fields: HashMap<String, String> =
                redis::from_redis_value(&value).map_err(backend)?;
            Reply::Fields(fields)
        }
        Command::SMembers { .. } | Command::TakeMembers { .. } | Command::ZRangeByScore { .. } => {
            Reply::Members(redis::from_redis_value(&value).map_err(backend)?)
        }
        Command::XAdd { .. } => {
            let id: String = redis::from_redis_value(&value).map_err(backend)?;
            Reply::Id(id.parse()?)
        }
        Command::XLast { .. } => {
            let range: StreamRangeReply = redis::from_redis_value(&value).map_err(backend)?;
            Reply::Entries(
                range
                    .ids
                    .into_iter()
                    .map(to_entry)
                    .collect::<Result<Vec<_>, _>>()?,
            )
        }
        Command::Time => {
            let (secs, micros): (i64, i64) = redis::from_redis_value(&value).map_err(backend)?;
            Reply::Int(secs * 1_000 + micros / 1_000)
        }
    };
    Ok(reply)
}

fn to_entry(raw: StreamId) -> Result<StreamEntry, StoreError> {
    let id = raw.id.parse()?;
    let mut fields = HashMap::with_capacity(raw.map.len());
    for (field, value) in raw.map {
        let value: String = redis::from_redis_value(&value).map_err(backend)?;
        fields.insert(field, value);
    }
    Ok(StreamEntry { id, fields })
}

#[cfg(test)]
mod tests {
    use classroom_store::{Batch, StoreExt, DATA_FIELD};
    use redis::Value;

    use super::*;

    fn bulk(text: &str) -> Value {
        Value::BulkString(text.as_bytes().to_vec())
    }

    fn server_error(line: &str) -> Value {
        let value = redis::parse_redis_value(format!("-{line}\r\n").as_bytes()).unwrap();
        assert!(matches!(value, Value::ServerError(_)));
        value
    }

    fn get(key: &str) -> Command {
        Command::Get { key: key.into() }
    }

    #[test]
    fn conditional_set_is_sent_with_px_and_nx() {
        let cmd = to_cmd(&Command::Set {
            key: "lock".into(),
            value: "relay-a".into(),
            ttl: Some(Duration::from_millis(2_500)),
            condition: SetCondition::IfAbsent,
        });
        let expected = redis::cmd("SET")
            .arg("lock")
            .arg("relay-a")
            .arg("PX")
            .arg(2_500u64)
            .arg("NX")
            .get_packed_command();
        assert_eq!(cmd.get_packed_command(), expected);
    }

    #[test]
    fn time_is_reported_in_milliseconds() {
        let reply = decode(&Command::Time, Value::Array(vec![bulk("1700000000"), bulk("123456")]));
        assert_eq!(reply.unwrap(), Reply::Int(1_700_000_000_123));
    }

    #[test]
    fn swap_distinguishes_missing_from_previous_value() {
        let swap = Command::Swap {
            key: "host".into(),
            value: "t2".into(),
            ttl: None,
        };
        assert_eq!(decode(&swap, Value::Nil).unwrap(), Reply::Nil);
        assert_eq!(decode(&swap, bulk("t1")).unwrap(), Reply::Text("t1".into()));
    }

    #[test]
    fn refused_conditional_set_is_nil() {
        let set = Command::Set {
            key: "lock".into(),
            value: "relay-a".into(),
            ttl: None,
            condition: SetCondition::IfAbsent,
        };
        assert!(!decode(&set, Value::Nil).unwrap().was_applied());
        assert!(decode(&set, Value::Okay).unwrap().was_applied());
    }

    #[test]
    fn newest_entry_is_decoded_from_xrevrange() {
        let raw = Value::Array(vec![Value::Array(vec![
            bulk("1700000000000-3"),
            Value::Array(vec![bulk(DATA_FIELD), bulk("{\"n\":1}")]),
        ])]);
        let entries = decode(&Command::XLast { key: "log".into() }, raw)
            .unwrap()
            .into_entries()
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, EntryId::new(1_700_000_000_000, 3));
        assert_eq!(entries[0].field(DATA_FIELD), Some("{\"n\":1}"));
        assert_eq!(
            decode(&Command::XLast { key: "log".into() }, Value::Array(Vec::new())).unwrap(),
            Reply::Entries(Vec::new())
        );
    }

    #[test]
    fn failed_command_inside_exec_fails_alone() {
        let commands = vec![get("a"), get("b"), get("c")];
        let exec = Value::Array(vec![
            bulk("1"),
            server_error("WRONGTYPE Operation against a key holding the wrong kind of value"),
            Value::Nil,
        ]);
        let results = exec_replies(&commands, exec);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), &Reply::Text("1".into()));
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap(), &Reply::Nil);
    }

    #[test]
    fn aborted_exec_fails_every_command() {
        let commands = vec![get("a"), get("b")];
        let results = exec_replies(&commands, server_error("EXECABORT Transaction discarded"));
        assert!(results.iter().all(Result::is_err));
        let results = exec_replies(&commands, Value::Array(vec![bulk("1")]));
        assert!(results.iter().all(Result::is_err));
    }

    /// Runs against the server named by REDIS_URL; skipped when it is unset.
    #[test_timeout::tokio_timeout_test(10)]
    async fn redis_store_roundtrip() -> anyhow::Result<()> {
        let Ok(url) = std::env::var("REDIS_URL") else {
            return Ok(());
        };
        let store = RedisStore::connect(&url, &[], Duration::from_millis(500)).await?;
        let prefix = format!("relay-test:{{{}}}", uuid::Uuid::new_v4());
        let text = format!("{prefix}:text");
        let set = format!("{prefix}:set");
        let log = format!("{prefix}:log");

        store.set(&text, "v", Some(Duration::from_secs(30))).await?;
        let mut batch = Batch::new(&store);
        batch
            .push(Command::SAdd {
                key: text.clone(),
                member: "m".into(),
            })
            .await;
        batch.add_member(&set, "m").await;
        let report = batch.commit().await;
        if store.mode() == StoreMode::Single {
            assert_eq!(report.applied(), 1);
            assert_eq!(report.failures().len(), 1);
        }
        assert_eq!(store.take_members(&set).await?, vec!["m".to_string()]);
        assert!(store.smembers(&set).await?.is_empty());
        assert!(!store.del_if_equals(&text, "other").await?);
        assert!(store.del_if_equals(&text, "v").await?);

        let mut reader = store.reader().await?;
        let writer_log = log.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Store::execute(&store, Command::append(writer_log, Some(10), "hello")).await
        });
        let batch = reader
            .read(&[(log.clone(), EntryId::ZERO)], 10, Duration::from_secs(2))
            .await?;
        writer.await??;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].1[0].field(DATA_FIELD), Some("hello"));
        reader.execute(Command::Del { key: log }).await?;
        Ok(())
    }
}
