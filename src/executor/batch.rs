// Batch lifecycle commands.

use crate::context::ServerContext;
use crate::error::{KvError, Result};
use crate::executor::{expect_params, CommandExecutor};
use crate::network::message::Command;
use crate::session::Session;
use async_trait::async_trait;

/// `BATCH_BEGIN` — enter batch mode (idempotent, clears the buffer).
pub struct BatchBegin;

#[async_trait]
impl CommandExecutor for BatchBegin {
    async fn execute(
        &self,
        _ctx: &ServerContext,
        session: &Session,
        command: &Command,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        expect_params(command, 0)?;
        session.begin_batch()?;
        Ok(Vec::new())
    }
}

/// `BATCH_ABORT` — drop the buffer and leave batch mode (idempotent).
pub struct BatchAbort;

#[async_trait]
impl CommandExecutor for BatchAbort {
    async fn execute(
        &self,
        _ctx: &ServerContext,
        session: &Session,
        command: &Command,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        expect_params(command, 0)?;
        session.abort_batch();
        Ok(Vec::new())
    }
}

/// `BATCH_COMMIT [expected_size]` — apply the whole buffer as one durable
/// batch: a single WAL append covering every pair, then the engine commit,
/// then the meta advance.
pub struct BatchCommit;

#[async_trait]
impl CommandExecutor for BatchCommit {
    async fn execute(
        &self,
        ctx: &ServerContext,
        session: &Session,
        command: &Command,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let expected = match command.params.len() {
            0 => None,
            1 => Some(parse_expected_size(&command.params[0])?),
            n => {
                return Err(KvError::ArgInvalid(format!(
                    "BATCH_COMMIT takes at most one parameter, got {}",
                    n
                )))
            }
        };

        let db = session.bound_db()?;
        let batch = session.take_batch(expected)?;
        ctx.durable_write(&db, &batch)?;
        Ok(Vec::new())
    }
}

/// The expected size travels as a u64 big-endian parameter.
fn parse_expected_size(bytes: &[u8]) -> Result<usize> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| KvError::ArgInvalid("expected size must be 8 bytes".into()))?;
    Ok(u64::from_be_bytes(raw) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_size_is_u64_big_endian() {
        assert_eq!(parse_expected_size(&3u64.to_be_bytes()).unwrap(), 3);
        assert!(parse_expected_size(b"3").is_err());
        assert!(parse_expected_size(&[]).is_err());
    }
}
