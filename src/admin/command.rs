//! Administrative commands, attribute sets and the request/reply payloads
//!
//! Requests and replies travel as JSON in the payload of messages tagged
//! with the admin format.

use crate::error::{reason, CompletionCode, MqError, MqResult};
use crate::message::FormatError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Supported administrative commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandCode {
    Ping,
    CreateQueue,
    ChangeQueue,
    DeleteQueue,
    ClearQueue,
    InquireQueue,
    InquireQueueNames,
}

impl CommandCode {
    pub const ALL: [CommandCode; 7] = [
        CommandCode::Ping,
        CommandCode::CreateQueue,
        CommandCode::ChangeQueue,
        CommandCode::DeleteQueue,
        CommandCode::ClearQueue,
        CommandCode::InquireQueue,
        CommandCode::InquireQueueNames,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CommandCode::Ping => "PING",
            CommandCode::CreateQueue => "CREATE_QUEUE",
            CommandCode::ChangeQueue => "CHANGE_QUEUE",
            CommandCode::DeleteQueue => "DELETE_QUEUE",
            CommandCode::ClearQueue => "CLEAR_QUEUE",
            CommandCode::InquireQueue => "INQUIRE_QUEUE",
            CommandCode::InquireQueueNames => "INQUIRE_QUEUE_NAMES",
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CommandCode {
    type Err = MqError;

    /// Accepts `CREATE_QUEUE`, `create-queue` and `createqueue` spellings
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        CommandCode::ALL
            .into_iter()
            .find(|code| code.name().replace('_', "") == wanted)
            .ok_or_else(|| MqError::invalid_argument(format!("unknown admin command '{s}'")))
    }
}

/// Value of one admin attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Int(i64),
    Str(String),
    IntList(Vec<i64>),
    StrList(Vec<String>),
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

impl From<Vec<String>> for AttrValue {
    fn from(v: Vec<String>) -> Self {
        AttrValue::StrList(v)
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Int(v) => write!(f, "{v}"),
            AttrValue::Str(v) => f.write_str(v),
            AttrValue::IntList(v) => write!(f, "{v:?}"),
            AttrValue::StrList(v) => write!(f, "{}", v.join(",")),
        }
    }
}

/// Flat name → value attribute set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeSet(BTreeMap<String, AttrValue>);

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.0.get(name)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.0.get(name) {
            Some(AttrValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(AttrValue::Str(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_str_list(&self, name: &str) -> Option<&[String]> {
        match self.0.get(name) {
            Some(AttrValue::StrList(v)) => Some(v),
            _ => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Request payload sent to the command queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminRequest {
    pub command: CommandCode,
    #[serde(default)]
    pub parameters: AttributeSet,
}

impl AdminRequest {
    pub fn new(command: CommandCode, parameters: AttributeSet) -> Self {
        Self {
            command,
            parameters,
        }
    }

    pub fn to_payload(&self) -> MqResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| MqError::Format(FormatError::AdminPayload(e.to_string())))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, FormatError> {
        serde_json::from_slice(payload).map_err(|e| FormatError::AdminPayload(e.to_string()))
    }
}

/// Error record inside a failed reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyError {
    pub completion: CompletionCode,
    pub reason: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

/// One reply message; a command produces one or more, the final one has `last` set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminReply {
    pub command: CommandCode,
    pub completion: CompletionCode,
    pub reason: i32,
    pub last: bool,
    #[serde(default)]
    pub parameters: AttributeSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl AdminReply {
    pub fn success(command: CommandCode, parameters: AttributeSet) -> Self {
        Self {
            command,
            completion: CompletionCode::Ok,
            reason: reason::NONE,
            last: true,
            parameters,
            error: None,
        }
    }

    /// "Command failed" reply carrying the specific cause as a nested record
    pub fn command_failed(command: CommandCode, cause: i32, parameter: Option<String>) -> Self {
        Self {
            command,
            completion: CompletionCode::Failed,
            reason: reason::COMMAND_FAILED,
            last: true,
            parameters: AttributeSet::new(),
            error: Some(ReplyError {
                completion: CompletionCode::Failed,
                reason: cause,
                parameter,
            }),
        }
    }

    /// Failure without a nested record
    pub fn failed(command: CommandCode, reason: i32) -> Self {
        Self {
            command,
            completion: CompletionCode::Failed,
            reason,
            last: true,
            parameters: AttributeSet::new(),
            error: None,
        }
    }

    pub fn to_payload(&self) -> MqResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| MqError::Format(FormatError::AdminPayload(e.to_string())))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, FormatError> {
        serde_json::from_slice(payload).map_err(|e| FormatError::AdminPayload(e.to_string()))
    }

    fn to_failure(&self) -> AdminFailure {
        AdminFailure {
            completion: self.completion,
            reason: self.reason,
            parameter: None,
            nested: self.error.as_ref().map(|e| {
                Box::new(AdminFailure {
                    completion: e.completion,
                    reason: e.reason,
                    parameter: e.parameter.clone(),
                    nested: None,
                })
            }),
        }
    }
}

/// Structured failure of an admin command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminFailure {
    pub completion: CompletionCode,
    pub reason: i32,
    pub parameter: Option<String>,
    pub nested: Option<Box<AdminFailure>>,
}

impl AdminFailure {
    /// The most specific reason: the nested one when present
    pub fn root_reason(&self) -> i32 {
        self.nested
            .as_ref()
            .map(|n| n.root_reason())
            .unwrap_or(self.reason)
    }
}

impl fmt::Display for AdminFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "completion {:?}, reason {}", self.completion, self.reason)?;
        if let Some(nested) = &self.nested {
            write!(f, " (cause: reason {}", nested.reason)?;
            if let Some(parameter) = &nested.parameter {
                write!(f, ", parameter {parameter}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// Parsed outcome of an admin command
#[derive(Debug, Clone, PartialEq)]
pub enum AdminResult {
    /// One attribute set per reply
    Success(Vec<AttributeSet>),
    Failed(AdminFailure),
}

impl AdminResult {
    /// Fold a complete reply sequence into a result; the first failed reply wins
    pub fn from_replies(replies: &[AdminReply]) -> Self {
        match replies
            .iter()
            .find(|r| r.completion == CompletionCode::Failed)
        {
            Some(failed) => AdminResult::Failed(failed.to_failure()),
            None => AdminResult::Success(replies.iter().map(|r| r.parameters.clone()).collect()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AdminResult::Success(_))
    }

    pub fn attributes(&self) -> &[AttributeSet] {
        match self {
            AdminResult::Success(sets) => sets,
            AdminResult::Failed(_) => &[],
        }
    }

    pub fn failure(&self) -> Option<&AdminFailure> {
        match self {
            AdminResult::Failed(failure) => Some(failure),
            AdminResult::Success(_) => None,
        }
    }
}
