use bon::Builder;
use serde::Serialize;
use serde_json::{Map, Value};

/// Command id assigned by the connection manager. Never 0.
pub type CmdId = u32;

/// Which server-side feed a subscription command targets.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum DataKeyType {
    /// Time-series values, sent in `tsSubCmds`
    Timeseries,
    /// Attribute values, sent in `attrSubCmds`
    Attribute,
}

/// Continuous subscription (or its cancellation).
///
/// `cmd_id` and `unsubscribe` are filled in by the connection manager; everything
/// else (`entityType`, `entityId`, `scope`, ...) is passed through untouched in
/// `params`.
#[non_exhaustive]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionCommand {
    #[builder(skip)]
    pub cmd_id: CmdId,
    /// Comma-separated key list, e.g. `temperature,humidity`
    #[builder(into)]
    pub keys: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(skip)]
    pub unsubscribe: Option<bool>,
    #[serde(flatten)]
    #[builder(default)]
    pub params: Map<String, Value>,
}

impl SubscriptionCommand {
    #[must_use]
    pub fn new<S: Into<String>>(keys: S) -> Self {
        Self {
            keys: keys.into(),
            ..Self::default()
        }
    }

    /// Add a pass-through field, e.g. `("entityId", json!("784f394c-..."))`.
    #[must_use]
    pub fn with_param<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Wire form of this command as a subscribe under `cmd_id`.
    pub(crate) fn subscribing(&self, cmd_id: CmdId) -> Self {
        Self {
            cmd_id,
            unsubscribe: None,
            ..self.clone()
        }
    }

    /// Wire form of this command as an unsubscribe of `cmd_id`.
    pub(crate) fn unsubscribing(&self, cmd_id: CmdId) -> Self {
        Self {
            cmd_id,
            unsubscribe: Some(true),
            ..self.clone()
        }
    }
}

/// One-shot history query. Time range fields (`startTs`, `endTs`, `interval`,
/// `limit`, `agg`, ...) are caller-defined and carried in `params`.
#[non_exhaustive]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct HistoryCommand {
    #[builder(skip)]
    pub cmd_id: CmdId,
    #[builder(into)]
    pub keys: String,
    #[serde(flatten)]
    #[builder(default)]
    pub params: Map<String, Value>,
}

impl HistoryCommand {
    #[must_use]
    pub fn new<S: Into<String>>(keys: S) -> Self {
        Self {
            keys: keys.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_param<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub(crate) fn stamped(&self, cmd_id: CmdId) -> Self {
        Self {
            cmd_id,
            ..self.clone()
        }
    }
}

/// What a subscriber asks the server for. Exactly one command per subscriber.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    /// Continuous feed of time-series or attribute updates
    Subscription {
        kind: DataKeyType,
        command: SubscriptionCommand,
    },
    /// One-shot history query
    History(HistoryCommand),
}

impl Request {
    #[must_use]
    pub fn time_series(command: SubscriptionCommand) -> Self {
        Self::Subscription {
            kind: DataKeyType::Timeseries,
            command,
        }
    }

    #[must_use]
    pub fn attributes(command: SubscriptionCommand) -> Self {
        Self::Subscription {
            kind: DataKeyType::Attribute,
            command,
        }
    }

    #[must_use]
    pub fn history(command: HistoryCommand) -> Self {
        Self::History(command)
    }

    /// The comma-separated key list of the underlying command.
    #[must_use]
    pub fn keys(&self) -> &str {
        match self {
            Self::Subscription { command, .. } => &command.keys,
            Self::History(command) => &command.keys,
        }
    }

    /// Individual requested keys, in order, skipping empty entries.
    pub fn key_list(&self) -> impl Iterator<Item = &str> {
        self.keys().split(',').filter(|key| !key.is_empty())
    }
}
