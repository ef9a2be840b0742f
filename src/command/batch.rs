//! Executing many commands at once.
//!
//! A [`CommandBatch`] runs commands that cannot be batched one after another, then
//! fans every other command out into the pools of their clients and sends each
//! distinct pool once. Commands bound to different clients (and so possibly different
//! pools) can share a batch.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::{COMMAND_AFTER_SEND, COMMAND_BEFORE_SEND};
use crate::error::{Result, VolleyError};
use crate::event::{Event, EventContext, SubscriptionId};
use crate::metrics;
use crate::pool::TransferPool;
use crate::request::{self, Request};

use super::{COMMAND_PARAM, Command};

/// Priority of the observer that finalizes batched commands; runs after every other
/// `request.complete` observer.
const FINALIZE_PRIORITY: i32 = -99999;

/// Selects commands in a batch, either one specific command or every command of a name.
#[derive(Debug, Clone, Copy)]
pub enum CommandSelector<'a> {
    Command(&'a Command),
    Name(&'a str),
}

impl CommandSelector<'_> {
    fn matches(&self, command: &Command) -> bool {
        match self {
            CommandSelector::Command(selected) => selected.ptr_eq(command),
            CommandSelector::Name(name) => command.name() == *name,
        }
    }
}

impl<'a> From<&'a Command> for CommandSelector<'a> {
    fn from(command: &'a Command) -> Self {
        CommandSelector::Command(command)
    }
}

impl<'a> From<&'a str> for CommandSelector<'a> {
    fn from(name: &'a str) -> Self {
        CommandSelector::Name(name)
    }
}

/// Ordered collection of commands executed together.
#[derive(Debug, Clone, Default)]
pub struct CommandBatch {
    commands: Vec<Command>,
}

impl CommandBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_command(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    /// Remove every matching command. Returns how many were removed.
    pub fn remove_command<'a>(&mut self, selector: impl Into<CommandSelector<'a>>) -> usize {
        let selector = selector.into();
        let before = self.commands.len();
        self.commands.retain(|c| !selector.matches(c));
        before - self.commands.len()
    }

    pub fn has_command<'a>(&self, selector: impl Into<CommandSelector<'a>>) -> bool {
        let selector = selector.into();
        self.commands.iter().any(|c| selector.matches(c))
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Command> {
        self.commands.iter()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Commands that must run on their own, in insertion order.
    pub fn serial_commands(&self) -> Vec<Command> {
        self.commands
            .iter()
            .filter(|c| !c.can_batch())
            .cloned()
            .collect()
    }

    /// Commands that may share a send cycle, in insertion order.
    pub fn parallel_commands(&self) -> Vec<Command> {
        self.commands
            .iter()
            .filter(|c| c.can_batch())
            .cloned()
            .collect()
    }

    /// Execute every command.
    ///
    /// # Errors
    /// - `Validation` if any command has no client; nothing is sent
    /// - the first failure of a serial command; later commands are not sent
    /// - the first failing pool's error once every pool has been sent
    pub fn execute(&self) -> Result<()> {
        let invalid: Vec<Command> = self
            .commands
            .iter()
            .filter(|c| c.client().is_none())
            .cloned()
            .collect();
        if !invalid.is_empty() {
            return Err(VolleyError::Validation {
                message: "Commands found with no associated client".to_string(),
                commands: invalid,
            });
        }

        let serial = self.serial_commands();
        for command in &serial {
            tracing::debug!(command_id = %command.id(), command = command.name(), "Executing serial command");
            command.execute()?;
            command.result()?;
        }
        metrics::record_commands("serial", serial.len());

        let parallel = self.parallel_commands();
        let mut pools: Vec<TransferPool> = Vec::new();
        for command in &parallel {
            let client = command
                .client()
                .ok_or_else(|| VolleyError::MissingClient(command.name().to_string()))?;
            let request = command.prepare()?;
            command.clear_result();
            request.set_param(COMMAND_PARAM, command.id().0.to_string());
            attach_finalizer(command, &request);

            client.events().dispatch(&Event::new(
                COMMAND_BEFORE_SEND,
                EventContext::Command(command.clone()),
            ))?;

            let pool = client.pool();
            pool.add(request)?;
            if !pools.iter().any(|p| p.ptr_eq(pool)) {
                pools.push(pool.clone());
            }
        }

        tracing::debug!(
            serial = serial.len(),
            parallel = parallel.len(),
            pools = pools.len(),
            "Sending batched commands"
        );

        let mut first_error = None;
        for pool in &pools {
            if let Err(e) = pool.send() {
                tracing::warn!(pool_id = %pool.id(), error = %e, "Pool failed during batch execution");
                first_error.get_or_insert(e);
            }
        }
        metrics::record_commands("parallel", parallel.len());

        first_error.map_or(Ok(()), Err)
    }
}

/// Finalize `command` when its request completes: extract the result and emit
/// `command.after_send`, exactly once.
fn attach_finalizer(command: &Command, request: &Request) {
    let weak = command.downgrade();
    let subscription: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
    let slot = subscription.clone();

    let id = request.events().subscribe_with_priority(
        request::COMPLETE,
        FINALIZE_PRIORITY,
        move |event| {
            let (Some(command), Some(request)) = (weak.upgrade(), event.request()) else {
                return Ok(());
            };
            if !request.has_param(COMMAND_PARAM) || !command.is_executed() {
                return Ok(());
            }

            if let Some(id) = slot.lock().take() {
                request.events().unsubscribe(id);
            }
            request.remove_param(COMMAND_PARAM);
            command.result()?;

            if let Some(client) = command.client() {
                client.events().dispatch(&Event::new(
                    COMMAND_AFTER_SEND,
                    EventContext::Command(command.clone()),
                ))?;
            }
            Ok(())
        },
    );
    *subscription.lock() = Some(id);
}

impl FromIterator<Command> for CommandBatch {
    fn from_iter<I: IntoIterator<Item = Command>>(iter: I) -> Self {
        Self {
            commands: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a CommandBatch {
    type Item = &'a Command;
    type IntoIter = std::slice::Iter<'a, Command>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::HttpCommand;

    #[test]
    fn test_membership_by_command_and_name() {
        let list = Command::new(HttpCommand::get("widgets.list", "widgets"));
        let show = Command::new(HttpCommand::get("widgets.show", "widgets/1"));
        let show_again = Command::new(HttpCommand::get("widgets.show", "widgets/2"));

        let mut batch = CommandBatch::new();
        batch
            .add_command(list.clone())
            .add_command(show.clone())
            .add_command(show_again.clone());

        assert_eq!(batch.len(), 3);
        assert!(batch.has_command(&list));
        assert!(batch.has_command("widgets.show"));
        assert!(!batch.has_command("widgets.delete"));

        assert_eq!(batch.remove_command("widgets.show"), 2);
        assert!(!batch.has_command(&show));
        assert_eq!(batch.remove_command(&list), 1);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_partitions_keep_insertion_order() {
        let a = Command::new(HttpCommand::get("a", "a"));
        let b = Command::new(HttpCommand::get("b", "b").serial());
        let c = Command::new(HttpCommand::get("c", "c"));
        let d = Command::new(HttpCommand::get("d", "d").serial());
        let batch: CommandBatch = [a, b, c, d].into_iter().collect();

        let names = |commands: Vec<Command>| -> Vec<String> {
            commands.iter().map(|c| c.name().to_string()).collect()
        };
        assert_eq!(names(batch.serial_commands()), vec!["b", "d"]);
        assert_eq!(names(batch.parallel_commands()), vec!["a", "c"]);
        assert_eq!((&batch).into_iter().count(), 4);
    }

    #[test]
    fn test_missing_client_fails_before_anything_runs() {
        let batch: CommandBatch = [Command::new(HttpCommand::get("orphan", "x"))]
            .into_iter()
            .collect();
        let err = batch.execute().unwrap_err();
        let VolleyError::Validation { commands, .. } = err else {
            panic!("expected validation error");
        };
        assert_eq!(commands.len(), 1);
        assert!(!commands[0].is_prepared());
    }
}
