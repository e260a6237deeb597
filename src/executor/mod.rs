// Command dispatch.
//
// One closed `CommandKind` enum names every wire command; the registry maps
// each kind to its executor. The list in `Registry::new` is the single
// authoritative registration table, and the match inside it is exhaustive,
// so adding a kind without a handler fails to compile.

pub mod admin;
pub mod batch;
pub mod cluster;
pub mod kv;

use crate::context::ServerContext;
use crate::error::{KvError, Result};
use crate::network::message::Command;
use crate::session::Session;
use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Use,
    CreateDb,
    EnableDb,
    DisableDb,
    Exists,
    Get,
    Put,
    BatchBegin,
    BatchAbort,
    BatchCommit,
    ClusterInfo,
    ShowDbs,
}

impl CommandKind {
    pub const ALL: [CommandKind; 12] = [
        CommandKind::Use,
        CommandKind::CreateDb,
        CommandKind::EnableDb,
        CommandKind::DisableDb,
        CommandKind::Exists,
        CommandKind::Get,
        CommandKind::Put,
        CommandKind::BatchBegin,
        CommandKind::BatchAbort,
        CommandKind::BatchCommit,
        CommandKind::ClusterInfo,
        CommandKind::ShowDbs,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "USE" => CommandKind::Use,
            "CREATE_DB" => CommandKind::CreateDb,
            "ENABLE_DB" => CommandKind::EnableDb,
            "DISABLE_DB" => CommandKind::DisableDb,
            "EXISTS" => CommandKind::Exists,
            "GET" => CommandKind::Get,
            "PUT" => CommandKind::Put,
            "BATCH_BEGIN" => CommandKind::BatchBegin,
            "BATCH_ABORT" => CommandKind::BatchAbort,
            "BATCH_COMMIT" => CommandKind::BatchCommit,
            "CLUSTER_INFO" => CommandKind::ClusterInfo,
            "SHOW_DBS" => CommandKind::ShowDbs,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Use => "USE",
            CommandKind::CreateDb => "CREATE_DB",
            CommandKind::EnableDb => "ENABLE_DB",
            CommandKind::DisableDb => "DISABLE_DB",
            CommandKind::Exists => "EXISTS",
            CommandKind::Get => "GET",
            CommandKind::Put => "PUT",
            CommandKind::BatchBegin => "BATCH_BEGIN",
            CommandKind::BatchAbort => "BATCH_ABORT",
            CommandKind::BatchCommit => "BATCH_COMMIT",
            CommandKind::ClusterInfo => "CLUSTER_INFO",
            CommandKind::ShowDbs => "SHOW_DBS",
        }
    }

    /// Admin commands are admitted only on the loopback manager surface.
    pub fn is_admin(self) -> bool {
        matches!(
            self,
            CommandKind::CreateDb
                | CommandKind::EnableDb
                | CommandKind::DisableDb
                | CommandKind::ShowDbs
        )
    }
}

/// One command handler. Executors are stateless; everything they need
/// arrives through the context, the session, and the request.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        ctx: &ServerContext,
        session: &Session,
        command: &Command,
    ) -> Result<Vec<Option<Vec<u8>>>>;
}

pub struct Registry {
    table: HashMap<CommandKind, Box<dyn CommandExecutor>>,
}

impl Registry {
    pub fn new() -> Self {
        let mut table: HashMap<CommandKind, Box<dyn CommandExecutor>> = HashMap::new();
        for kind in CommandKind::ALL {
            let executor: Box<dyn CommandExecutor> = match kind {
                CommandKind::Use => Box::new(kv::UseDb),
                CommandKind::CreateDb => Box::new(admin::CreateDb),
                CommandKind::EnableDb => Box::new(admin::EnableDb),
                CommandKind::DisableDb => Box::new(admin::DisableDb),
                CommandKind::Exists => Box::new(kv::Exists),
                CommandKind::Get => Box::new(kv::Get),
                CommandKind::Put => Box::new(kv::Put),
                CommandKind::BatchBegin => Box::new(batch::BatchBegin),
                CommandKind::BatchAbort => Box::new(batch::BatchAbort),
                CommandKind::BatchCommit => Box::new(batch::BatchCommit),
                CommandKind::ClusterInfo => Box::new(cluster::ClusterInfo),
                CommandKind::ShowDbs => Box::new(admin::ShowDbs),
            };
            table.insert(kind, executor);
        }
        Self { table }
    }

    pub async fn dispatch(
        &self,
        kind: CommandKind,
        ctx: &ServerContext,
        session: &Session,
        command: &Command,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        match self.table.get(&kind) {
            Some(executor) => executor.execute(ctx, session, command).await,
            None => Err(KvError::Internal(format!(
                "no executor registered for {}",
                kind.name()
            ))),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Require exactly `n` parameters.
pub(crate) fn expect_params(command: &Command, n: usize) -> Result<()> {
    if command.params.len() != n {
        return Err(KvError::ArgInvalid(format!(
            "{} takes {} parameter(s), got {}",
            command.name,
            n,
            command.params.len()
        )));
    }
    Ok(())
}

pub(crate) fn utf8_param(command: &Command, index: usize) -> Result<String> {
    let bytes = command
        .params
        .get(index)
        .ok_or_else(|| KvError::ArgInvalid(format!("{}: missing parameter", command.name)))?;
    String::from_utf8(bytes.clone())
        .map_err(|_| KvError::ArgInvalid(format!("{}: parameter is not UTF-8", command.name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_name_round_trips_through_parse() {
        for kind in CommandKind::ALL {
            assert_eq!(CommandKind::parse(kind.name()), Some(kind));
        }
        assert_eq!(CommandKind::parse("DROP_TABLE"), None);
        assert_eq!(CommandKind::parse("put"), None);
    }

    #[test]
    fn admin_partition_matches_the_wire_contract() {
        let admin: Vec<&str> = CommandKind::ALL
            .iter()
            .filter(|k| k.is_admin())
            .map(|k| k.name())
            .collect();
        assert_eq!(admin, vec!["CREATE_DB", "ENABLE_DB", "DISABLE_DB", "SHOW_DBS"]);
        assert!(!CommandKind::ClusterInfo.is_admin());
    }

    #[test]
    fn registry_covers_every_kind() {
        let registry = Registry::new();
        assert_eq!(registry.table.len(), CommandKind::ALL.len());
    }
}
