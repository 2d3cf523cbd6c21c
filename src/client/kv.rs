//! Key-value map client.
//!
//! A [`KvMap`] is only a map name bound to a connection. Every operation is
//! an independent round trip sharing the connection's transport, so an
//! operation in flight when the transport drops fails with a connection
//! error and has to be retried by the caller.

use crate::message::{Message, codec};
use crate::transport::message::ClientMessage;
use crate::utils::error::{Error, Result};

use super::Connection;

#[derive(Debug)]
pub(crate) enum MapOp {
    Get { key: String },
    Set { key: String, value: Message },
    Remove { key: String },
}

impl MapOp {
    pub fn into_frame(self, seq: u64, map: String) -> ClientMessage {
        match self {
            MapOp::Get { key } => ClientMessage::MapGet { seq, map, key },
            MapOp::Set { key, value } => ClientMessage::MapSet {
                seq,
                map,
                key,
                value: codec::encode(&value),
            },
            MapOp::Remove { key } => ClientMessage::MapRemove { seq, map, key },
        }
    }
}

#[derive(Debug, Clone)]
pub struct KvMap {
    connection: Connection,
    name: String,
}

impl KvMap {
    pub(crate) fn new(connection: Connection, name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::invalid_argument("map name must not be empty"));
        }
        Ok(Self {
            connection,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stored message, or `None` when the key is absent.
    pub async fn get(&self, key: &str) -> Result<Option<Message>> {
        let key = checked_key(key)?;
        self.connection
            .map_operation(&self.name, MapOp::Get { key })
            .await
    }

    /// Upsert; the last write wins.
    pub async fn set(&self, key: &str, value: Message) -> Result<()> {
        let key = checked_key(key)?;
        self.connection.check_size(&value)?;
        self.connection
            .map_operation(&self.name, MapOp::Set { key, value })
            .await
            .map(|_| ())
    }

    /// Removing an absent key is not an error.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let key = checked_key(key)?;
        self.connection
            .map_operation(&self.name, MapOp::Remove { key })
            .await
            .map(|_| ())
    }
}

fn checked_key(key: &str) -> Result<String> {
    if key.is_empty() {
        return Err(Error::invalid_argument("map key must not be empty"));
    }
    Ok(key.to_string())
}
