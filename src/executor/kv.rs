// Point read/write commands and session binding.

use crate::context::ServerContext;
use crate::error::{KvError, Result};
use crate::executor::{expect_params, utf8_param, CommandExecutor};
use crate::network::message::Command;
use crate::session::Session;
use crate::storage::{KvStore, WriteBatch};
use async_trait::async_trait;

/// `USE <db>` — bind the session to a database.
pub struct UseDb;

#[async_trait]
impl CommandExecutor for UseDb {
    async fn execute(
        &self,
        ctx: &ServerContext,
        session: &Session,
        command: &Command,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        expect_params(command, 1)?;
        let name = utf8_param(command, 0)?;
        let db = ctx.lookup_db(&name)?;
        session.set_db(db);
        Ok(Vec::new())
    }
}

/// `GET k₁…kₙ` — one value or null per key. A batching session sees its
/// own buffered writes first.
pub struct Get;

#[async_trait]
impl CommandExecutor for Get {
    async fn execute(
        &self,
        _ctx: &ServerContext,
        session: &Session,
        command: &Command,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        if command.params.is_empty() {
            return Err(KvError::ArgInvalid("GET requires at least one key".into()));
        }
        let db = session.bound_db()?;
        let mut result = Vec::with_capacity(command.params.len());
        for key in &command.params {
            let value = match session.buffered(key) {
                Some(value) => Some(value),
                None => db.store().get(key)?,
            };
            result.push(value);
        }
        Ok(result)
    }
}

/// `EXISTS k₁…kₙ` — one-byte boolean per key.
pub struct Exists;

#[async_trait]
impl CommandExecutor for Exists {
    async fn execute(
        &self,
        _ctx: &ServerContext,
        session: &Session,
        command: &Command,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        if command.params.is_empty() {
            return Err(KvError::ArgInvalid(
                "EXISTS requires at least one key".into(),
            ));
        }
        let db = session.bound_db()?;
        let mut result = Vec::with_capacity(command.params.len());
        for key in &command.params {
            let found = session.buffered(key).is_some() || db.store().contains(key)?;
            result.push(Some(vec![u8::from(found)]));
        }
        Ok(result)
    }
}

/// `PUT k₁ v₁ … kₙ vₙ` — buffered while batching, otherwise applied
/// immediately through the WAL.
pub struct Put;

#[async_trait]
impl CommandExecutor for Put {
    async fn execute(
        &self,
        ctx: &ServerContext,
        session: &Session,
        command: &Command,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        if command.params.is_empty() || command.params.len() % 2 != 0 {
            return Err(KvError::ArgInvalid(
                "PUT requires one or more key/value pairs".into(),
            ));
        }
        let db = session.bound_db()?;

        let pairs: Vec<(Vec<u8>, Vec<u8>)> = command
            .params
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();

        if session.is_batching() {
            session.buffer_put(pairs)?;
        } else {
            let mut batch = WriteBatch::new();
            for (key, value) in pairs {
                batch.set(key, value);
            }
            ctx.durable_write(&db, &batch)?;
        }
        Ok(Vec::new())
    }
}
