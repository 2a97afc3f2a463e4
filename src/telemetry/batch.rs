use serde::Serialize;

use super::types::request::{DataKeyType, HistoryCommand, SubscriptionCommand};

/// Commands waiting to be sent, in the shape the server expects:
/// `{"tsSubCmds": [...], "historyCmds": [...], "attrSubCmds": [...]}`.
///
/// Subscribes and unsubscribes of one feed share a list so the server sees them in
/// the order they were issued.
#[non_exhaustive]
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandBatch {
    pub ts_sub_cmds: Vec<SubscriptionCommand>,
    pub history_cmds: Vec<HistoryCommand>,
    pub attr_sub_cmds: Vec<SubscriptionCommand>,
}

impl CommandBatch {
    pub fn enqueue_subscription(&mut self, kind: DataKeyType, command: SubscriptionCommand) {
        match kind {
            DataKeyType::Timeseries => self.ts_sub_cmds.push(command),
            DataKeyType::Attribute => self.attr_sub_cmds.push(command),
        }
    }

    pub fn enqueue_history(&mut self, command: HistoryCommand) {
        self.history_cmds.push(command);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ts_sub_cmds.is_empty()
            && self.history_cmds.is_empty()
            && self.attr_sub_cmds.is_empty()
    }

    /// Take everything queued so far, leaving the batch empty. `None` if nothing is queued.
    pub fn take_if_non_empty(&mut self) -> Option<CommandBatch> {
        if self.is_empty() {
            None
        } else {
            Some(std::mem::take(self))
        }
    }

    /// Put back a batch that could not be sent, ahead of anything queued since.
    pub fn requeue(&mut self, mut unsent: CommandBatch) {
        unsent.ts_sub_cmds.append(&mut self.ts_sub_cmds);
        unsent.history_cmds.append(&mut self.history_cmds);
        unsent.attr_sub_cmds.append(&mut self.attr_sub_cmds);
        *self = unsent;
    }

    pub fn clear(&mut self) {
        self.ts_sub_cmds.clear();
        self.history_cmds.clear();
        self.attr_sub_cmds.clear();
    }
}
