//! Immutable catalog of admin command parameters
//!
//! The standard catalog is built once on first use and shared by `Arc`. It
//! tells the admin engine which parameters each command accepts and requires,
//! and which values they may take.

use super::command::{AttrValue, AttributeSet, CommandCode};
use crate::error::{MqError, MqResult};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;

use CommandCode::*;

/// Longest object name
pub const MAX_OBJECT_NAME: usize = 48;

/// Value constraint of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Int { min: i64, max: i64 },
    Str { max_len: usize },
    Enum(&'static [&'static str]),
    StrList,
}

/// Definition of one parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamDef {
    pub name: &'static str,
    pub id: i32,
    pub kind: ParamKind,
    /// Commands that accept this parameter in a request; empty for reply-only parameters
    pub accepted_by: &'static [CommandCode],
    pub required_by: &'static [CommandCode],
}

pub const YES_NO: &[&str] = &["YES", "NO"];
pub const ENABLED_INHIBITED: &[&str] = &["ENABLED", "INHIBITED"];
pub const QUEUE_TYPES: &[&str] = &["LOCAL", "MODEL"];
pub const DEFINITION_TYPES: &[&str] = &["TEMPDYN", "PERMDYN"];

const QUEUE_ATTRS: &[CommandCode] = &[CreateQueue, ChangeQueue];

const STANDARD_PARAMETERS: &[ParamDef] = &[
    ParamDef {
        name: "Q_NAME",
        id: 2016,
        kind: ParamKind::Str {
            max_len: MAX_OBJECT_NAME,
        },
        accepted_by: &[
            CreateQueue,
            ChangeQueue,
            DeleteQueue,
            ClearQueue,
            InquireQueue,
            InquireQueueNames,
        ],
        required_by: &[CreateQueue, ChangeQueue, DeleteQueue, ClearQueue, InquireQueue],
    },
    ParamDef {
        name: "Q_TYPE",
        id: 20,
        kind: ParamKind::Enum(QUEUE_TYPES),
        accepted_by: &[CreateQueue, InquireQueue, InquireQueueNames],
        required_by: &[],
    },
    ParamDef {
        name: "DEF_TYPE",
        id: 7,
        kind: ParamKind::Enum(DEFINITION_TYPES),
        accepted_by: QUEUE_ATTRS,
        required_by: &[],
    },
    ParamDef {
        name: "MAX_Q_DEPTH",
        id: 15,
        kind: ParamKind::Int {
            min: 0,
            max: 999_999_999,
        },
        accepted_by: QUEUE_ATTRS,
        required_by: &[],
    },
    ParamDef {
        name: "MAX_MSG_LENGTH",
        id: 13,
        kind: ParamKind::Int {
            min: 0,
            max: 104_857_600,
        },
        accepted_by: QUEUE_ATTRS,
        required_by: &[],
    },
    ParamDef {
        name: "INHIBIT_GET",
        id: 9,
        kind: ParamKind::Enum(ENABLED_INHIBITED),
        accepted_by: QUEUE_ATTRS,
        required_by: &[],
    },
    ParamDef {
        name: "INHIBIT_PUT",
        id: 10,
        kind: ParamKind::Enum(ENABLED_INHIBITED),
        accepted_by: QUEUE_ATTRS,
        required_by: &[],
    },
    ParamDef {
        name: "BACKOUT_THRESHOLD",
        id: 22,
        kind: ParamKind::Int {
            min: 0,
            max: 999_999_999,
        },
        accepted_by: QUEUE_ATTRS,
        required_by: &[],
    },
    ParamDef {
        name: "BACKOUT_REQ_Q_NAME",
        id: 2019,
        kind: ParamKind::Str {
            max_len: MAX_OBJECT_NAME,
        },
        accepted_by: QUEUE_ATTRS,
        required_by: &[],
    },
    ParamDef {
        name: "Q_DESC",
        id: 2013,
        kind: ParamKind::Str { max_len: 64 },
        accepted_by: QUEUE_ATTRS,
        required_by: &[],
    },
    ParamDef {
        name: "REPLACE",
        id: 1020,
        kind: ParamKind::Enum(YES_NO),
        accepted_by: &[CreateQueue],
        required_by: &[],
    },
    ParamDef {
        name: "PURGE",
        id: 1021,
        kind: ParamKind::Enum(YES_NO),
        accepted_by: &[DeleteQueue],
        required_by: &[],
    },
    ParamDef {
        name: "CURRENT_Q_DEPTH",
        id: 3,
        kind: ParamKind::Int {
            min: 0,
            max: i64::MAX,
        },
        accepted_by: &[],
        required_by: &[],
    },
    ParamDef {
        name: "OPEN_INPUT_COUNT",
        id: 17,
        kind: ParamKind::Int {
            min: 0,
            max: i64::MAX,
        },
        accepted_by: &[],
        required_by: &[],
    },
    ParamDef {
        name: "OPEN_OUTPUT_COUNT",
        id: 18,
        kind: ParamKind::Int {
            min: 0,
            max: i64::MAX,
        },
        accepted_by: &[],
        required_by: &[],
    },
    ParamDef {
        name: "Q_NAMES",
        id: 3011,
        kind: ParamKind::StrList,
        accepted_by: &[],
        required_by: &[],
    },
];

static STANDARD: Lazy<Arc<ParameterCatalog>> =
    Lazy::new(|| Arc::new(ParameterCatalog::from_definitions(STANDARD_PARAMETERS)));

/// Read-only parameter table
#[derive(Debug)]
pub struct ParameterCatalog {
    by_name: HashMap<&'static str, ParamDef>,
}

impl ParameterCatalog {
    /// The shared standard catalog
    pub fn standard() -> Arc<ParameterCatalog> {
        Arc::clone(&STANDARD)
    }

    pub fn from_definitions(definitions: &[ParamDef]) -> Self {
        Self {
            by_name: definitions.iter().map(|d| (d.name, *d)).collect(),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&ParamDef> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Parameters a command accepts, sorted by name
    pub fn accepted_by(&self, command: CommandCode) -> Vec<&ParamDef> {
        let mut params: Vec<_> = self
            .by_name
            .values()
            .filter(|d| d.accepted_by.contains(&command))
            .collect();
        params.sort_by_key(|d| d.name);
        params
    }

    /// Check a request's attributes: names known and accepted, values in range,
    /// required parameters present
    pub fn validate(&self, command: CommandCode, attributes: &AttributeSet) -> MqResult<()> {
        for (name, value) in attributes.iter() {
            let def = self.lookup(name).ok_or_else(|| MqError::InvalidAttribute {
                name: name.to_string(),
                reason: "unknown parameter".to_string(),
            })?;
            if !def.accepted_by.contains(&command) {
                return Err(MqError::InvalidAttribute {
                    name: name.to_string(),
                    reason: format!("not accepted by {command}"),
                });
            }
            check_value(def, value).map_err(|reason| MqError::InvalidAttribute {
                name: name.to_string(),
                reason,
            })?;
        }

        if let Some(missing) = self
            .by_name
            .values()
            .filter(|d| d.required_by.contains(&command))
            .find(|d| !attributes.contains(d.name))
        {
            return Err(MqError::InvalidAttribute {
                name: missing.name.to_string(),
                reason: format!("required by {command}"),
            });
        }

        Ok(())
    }
}

fn check_value(def: &ParamDef, value: &AttrValue) -> Result<(), String> {
    match (def.kind, value) {
        (ParamKind::Int { min, max }, AttrValue::Int(v)) => {
            if (min..=max).contains(v) {
                Ok(())
            } else {
                Err(format!("{v} outside {min}..={max}"))
            }
        }
        (ParamKind::Str { max_len }, AttrValue::Str(v)) => {
            if v.is_empty() {
                Err("empty value".to_string())
            } else if v.len() > max_len {
                Err(format!("longer than {max_len} characters"))
            } else {
                Ok(())
            }
        }
        (ParamKind::Enum(allowed), AttrValue::Str(v)) => {
            if allowed.contains(&v.as_str()) {
                Ok(())
            } else {
                Err(format!("'{v}' is not one of {}", allowed.join(", ")))
            }
        }
        (ParamKind::StrList, AttrValue::StrList(_)) => Ok(()),
        (kind, _) => Err(format!("wrong value type, expected {kind:?}")),
    }
}
