// Admin commands, admitted only on the loopback manager surface.

use crate::context::ServerContext;
use crate::error::Result;
use crate::executor::{expect_params, utf8_param, CommandExecutor};
use crate::network::message::Command;
use crate::session::Session;
use async_trait::async_trait;

/// `CREATE_DB <name>` — create a store under the server root and persist
/// it to the dblist.
pub struct CreateDb;

#[async_trait]
impl CommandExecutor for CreateDb {
    async fn execute(
        &self,
        ctx: &ServerContext,
        _session: &Session,
        command: &Command,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        expect_params(command, 1)?;
        let name = utf8_param(command, 0)?;
        ctx.create_db(&name)?;
        Ok(Vec::new())
    }
}

/// `ENABLE_DB <name>` — make a database visible to `USE` again.
pub struct EnableDb;

#[async_trait]
impl CommandExecutor for EnableDb {
    async fn execute(
        &self,
        ctx: &ServerContext,
        _session: &Session,
        command: &Command,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        expect_params(command, 1)?;
        let name = utf8_param(command, 0)?;
        ctx.set_db_enabled(&name, true)?;
        Ok(Vec::new())
    }
}

/// `DISABLE_DB <name>` — hide a database from `USE`; existing bindings
/// keep working.
pub struct DisableDb;

#[async_trait]
impl CommandExecutor for DisableDb {
    async fn execute(
        &self,
        ctx: &ServerContext,
        _session: &Session,
        command: &Command,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        expect_params(command, 1)?;
        let name = utf8_param(command, 0)?;
        ctx.set_db_enabled(&name, false)?;
        Ok(Vec::new())
    }
}

/// `SHOW_DBS` — the enabled database names, one result entry each.
pub struct ShowDbs;

#[async_trait]
impl CommandExecutor for ShowDbs {
    async fn execute(
        &self,
        ctx: &ServerContext,
        _session: &Session,
        command: &Command,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        expect_params(command, 0)?;
        Ok(ctx
            .enabled_dbs()
            .into_iter()
            .map(|name| Some(name.into_bytes()))
            .collect())
    }
}
