//! Package buffer and the inbound codec.
//!
//! A [`Package`] is one JSON value as it travels in one WebSocket text
//! frame. Outbound packages are shared by reference among all recipients of
//! a broadcast, so the buffer is immutable and cheap to clone.
//!
//! Inbound frames go through [`parse`] (JSON syntax) and [`verify`]
//! (structural shape) before they reach any dispatch logic. Both steps
//! convert failures into the structured error package the client receives.

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};

/// An immutable, shareable package buffer.
///
/// Cloning shares the underlying bytes; the buffer is freed when the last
/// clone is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package(Arc<str>);

impl Package {
    /// Builds a package from a JSON value.
    pub fn from_value(value: &Value) -> Self {
        Self(value.to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Package {
    fn from(raw: String) -> Self {
        Self(raw.into())
    }
}

impl AsRef<str> for Package {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated client package.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientPackage {
    /// Request to join the named game.
    Join { id: u64, nick: String, game: String },
    /// In-game state update for the sender's player.
    Update {
        team_id: u64,
        position: [f64; 2],
        angle: f64,
    },
    /// Request to leave the current game.
    Leave,
}

/// Error produced by [`parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("package is not valid JSON")]
    BadJson,
}

impl ParseError {
    /// The error package delivered to the client before the session closes.
    pub fn to_package(self) -> Package {
        error_package("One of the packages didn't contain a valid JSON.")
    }
}

/// Error produced by [`verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("package has no \"type\" field")]
    MissingType,
    #[error("join package is ill-formed")]
    BadJoin,
    #[error("update package is ill-formed")]
    BadUpdate,
    #[error("leave package is ill-formed")]
    BadLeave,
    #[error("unrecognized package type")]
    UnknownType,
}

impl VerifyError {
    /// The error package delivered to the client before the session closes.
    pub fn to_package(self) -> Package {
        match self {
            Self::MissingType => {
                error_package("One of the packages didn't have a \"type\" field.")
            }
            Self::BadJoin => error_package("A \"JOIN\" was ill-formed."),
            Self::BadUpdate => error_package("A \"UPDATE\" was ill-formed."),
            Self::BadLeave => error_package("A \"LEAVE\" was ill-formed."),
            Self::UnknownType => error_package("Cannot identify a package."),
        }
    }
}

fn error_package(message: &str) -> Package {
    Package::from_value(&json!({
        "closed": true,
        "type": "error",
        "message": message,
    }))
}

/// Parses one raw frame into a JSON value.
pub fn parse(raw: &str) -> Result<Value, ParseError> {
    serde_json::from_str(raw).map_err(|_| ParseError::BadJson)
}

/// Validates the structural shape of a parsed package.
///
/// Each package kind must carry exactly its required fields with the
/// required JSON types; extra fields, missing fields, wrong types and
/// unknown `type` values are all rejected. `angle` and the `position`
/// elements must be float-typed numbers (`90.0`, not `90`).
pub fn verify(value: Value) -> Result<ClientPackage, VerifyError> {
    let Value::Object(fields) = value else {
        return Err(VerifyError::MissingType);
    };
    let Some(Value::String(kind)) = fields.get("type") else {
        return Err(VerifyError::MissingType);
    };

    match kind.as_str() {
        "join" => {
            if fields.len() != 4 {
                return Err(VerifyError::BadJoin);
            }
            let id = fields
                .get("id")
                .and_then(Value::as_u64)
                .ok_or(VerifyError::BadJoin)?;
            let nick = fields
                .get("nick")
                .and_then(Value::as_str)
                .ok_or(VerifyError::BadJoin)?;
            let game = fields
                .get("game")
                .and_then(Value::as_str)
                .ok_or(VerifyError::BadJoin)?;
            Ok(ClientPackage::Join {
                id,
                nick: nick.to_owned(),
                game: game.to_owned(),
            })
        }
        "update" => {
            if fields.len() != 4 {
                return Err(VerifyError::BadUpdate);
            }
            let team_id = fields
                .get("team_id")
                .and_then(Value::as_u64)
                .ok_or(VerifyError::BadUpdate)?;
            let position = fields
                .get("position")
                .and_then(Value::as_array)
                .ok_or(VerifyError::BadUpdate)?;
            if position.len() != 2 {
                return Err(VerifyError::BadUpdate);
            }
            let x = as_float(&position[0]).ok_or(VerifyError::BadUpdate)?;
            let y = as_float(&position[1]).ok_or(VerifyError::BadUpdate)?;
            let angle = fields
                .get("angle")
                .and_then(as_float)
                .ok_or(VerifyError::BadUpdate)?;
            Ok(ClientPackage::Update {
                team_id,
                position: [x, y],
                angle,
            })
        }
        "leave" => {
            if fields.len() != 1 {
                return Err(VerifyError::BadLeave);
            }
            Ok(ClientPackage::Leave)
        }
        _ => Err(VerifyError::UnknownType),
    }
}

/// Accepts only numbers written as floats on the wire.
fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) if n.is_f64() => n.as_f64(),
        _ => None,
    }
}
