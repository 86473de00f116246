//! Single-node and cluster connection handling.
//!
//! Short-lived operations (scripts, PUBLISH) go through a shared multiplexed
//! connection; every dequeue loop gets its own dedicated connection so a
//! blocking `BRPOP` never stalls anything else. In cluster mode the cluster
//! client follows slot redirections internally, and pub/sub traffic uses a
//! seed-node connection (cluster pub/sub is broadcast, any node serves).

use redis::aio::{ConnectionLike, ConnectionManager, MultiplexedConnection};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{Cmd, Pipeline, RedisFuture, Value};

use crate::BrokerError;

/// Source of redis connections for the broker.
pub struct RedisPool {
    inner: PoolInner,
}

enum PoolInner {
    Single {
        client: redis::Client,
        shared: ConnectionManager,
    },
    Cluster {
        client: ClusterClient,
        shared: ClusterConnection,
        seed: redis::Client,
    },
}

impl RedisPool {
    /// Connect to `addr` (with or without the `redis://` scheme). With
    /// `cluster`, `addr` is used as the seed node.
    pub async fn connect(addr: &str, cluster: bool) -> Result<RedisPool, BrokerError> {
        let url = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("redis://{addr}")
        };

        let inner = if cluster {
            let client = ClusterClient::new(vec![url.clone()])?;
            let shared = client.get_async_connection().await?;
            let seed = redis::Client::open(url)?;
            PoolInner::Cluster {
                client,
                shared,
                seed,
            }
        } else {
            let client = redis::Client::open(url)?;
            let shared = ConnectionManager::new(client.clone()).await?;
            PoolInner::Single { client, shared }
        };
        Ok(RedisPool { inner })
    }

    /// Fail fast if the store is unreachable.
    pub async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.shared();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// The shared connection for short operations.
    pub fn shared(&self) -> PoolConn {
        match &self.inner {
            PoolInner::Single { shared, .. } => PoolConn::Single(shared.clone().into()),
            PoolInner::Cluster { shared, .. } => PoolConn::Cluster(shared.clone()),
        }
    }

    /// A fresh connection owned by one dequeue loop.
    pub async fn dedicated(&self) -> Result<PoolConn, BrokerError> {
        match &self.inner {
            PoolInner::Single { client, .. } => Ok(PoolConn::Single(
                client.get_multiplexed_async_connection().await?.into(),
            )),
            PoolInner::Cluster { client, .. } => {
                Ok(PoolConn::Cluster(client.get_async_connection().await?))
            }
        }
    }

    /// A fresh pub/sub connection.
    pub async fn pubsub(&self) -> Result<redis::aio::PubSub, BrokerError> {
        match &self.inner {
            PoolInner::Single { client, .. } => Ok(client.get_async_pubsub().await?),
            PoolInner::Cluster { seed, .. } => Ok(seed.get_async_pubsub().await?),
        }
    }
}

/// A connection from either pool flavor.
#[derive(Clone)]
pub enum PoolConn {
    Single(ConnWrap),
    Cluster(ClusterConnection),
}

/// Shared and dedicated single-node connections differ in type but not in
/// use; both are multiplexed handles.
#[derive(Clone)]
pub enum ConnWrap {
    Manager(ConnectionManager),
    Multiplexed(MultiplexedConnection),
}

impl From<ConnectionManager> for ConnWrap {
    fn from(c: ConnectionManager) -> Self {
        ConnWrap::Manager(c)
    }
}

impl From<MultiplexedConnection> for ConnWrap {
    fn from(c: MultiplexedConnection) -> Self {
        ConnWrap::Multiplexed(c)
    }
}

impl ConnectionLike for PoolConn {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            PoolConn::Single(ConnWrap::Manager(c)) => c.req_packed_command(cmd),
            PoolConn::Single(ConnWrap::Multiplexed(c)) => c.req_packed_command(cmd),
            PoolConn::Cluster(c) => c.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            PoolConn::Single(ConnWrap::Manager(c)) => c.req_packed_commands(cmd, offset, count),
            PoolConn::Single(ConnWrap::Multiplexed(c)) => c.req_packed_commands(cmd, offset, count),
            PoolConn::Cluster(c) => c.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            PoolConn::Single(ConnWrap::Manager(c)) => c.get_db(),
            PoolConn::Single(ConnWrap::Multiplexed(c)) => c.get_db(),
            PoolConn::Cluster(c) => c.get_db(),
        }
    }
}
