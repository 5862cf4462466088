use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::Result;
use crate::ssh::connection::{Connection, ConnectionManager};
use crate::ssh::params::{ConnectionKey, ConnectionParams};

/// A connection shared between jobs. Commands on one connection run one
/// at a time; hold the lock for the duration of a run.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Reuses one open connection per (host, user, port).
pub struct ConnectionPool {
    manager: ConnectionManager,
    connections: Mutex<HashMap<ConnectionKey, SharedConnection>>,
}

impl ConnectionPool {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Return the pooled connection for `params`, opening one if needed.
    pub async fn acquire(&self, params: &ConnectionParams) -> Result<SharedConnection> {
        let key = params.key();

        let stale = {
            let mut connections = self.connections.lock().await;
            match connections.get(&key) {
                Some(existing) => {
                    // A locked connection is in use; judge it on a later call.
                    let reusable = match existing.try_lock() {
                        Ok(conn) => conn.is_open() && !conn.is_broken(),
                        Err(_) => true,
                    };
                    if reusable {
                        return Ok(existing.clone());
                    }
                    connections.remove(&key)
                }
                None => None,
            }
        };
        if let Some(stale) = stale {
            stale.lock().await.close().await;
        }

        let mut fresh = self.manager.open(params.clone()).await?;

        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(&key) {
            // Another task opened the same login while we were connecting.
            let existing = existing.clone();
            drop(connections);
            fresh.close().await;
            return Ok(existing);
        }

        let shared = Arc::new(Mutex::new(fresh));
        connections.insert(key, shared.clone());
        Ok(shared)
    }

    /// Close and forget the connection for `params`, if pooled.
    pub async fn evict(&self, params: &ConnectionParams) -> bool {
        let removed = self.connections.lock().await.remove(&params.key());
        match removed {
            Some(shared) => {
                shared.lock().await.close().await;
                true
            }
            None => false,
        }
    }

    /// Close and forget `stale` if it is still the pooled connection for
    /// `params`. A replacement opened by another task is left alone.
    pub async fn discard(&self, params: &ConnectionParams, stale: &SharedConnection) -> bool {
        let key = params.key();
        let removed = {
            let mut connections = self.connections.lock().await;
            let current = connections
                .get(&key)
                .is_some_and(|pooled| Arc::ptr_eq(pooled, stale));
            if current {
                connections.remove(&key)
            } else {
                None
            }
        };
        match removed {
            Some(shared) => {
                shared.lock().await.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Close every pooled connection.
    pub async fn close_all(&self) {
        let drained: Vec<SharedConnection> = self
            .connections
            .lock()
            .await
            .drain()
            .map(|(_, conn)| conn)
            .collect();

        let count = drained.len();
        for shared in drained {
            shared.lock().await.close().await;
        }
        if count > 0 {
            tracing::info!(count, "Closed pooled connections");
        }
    }
}
