use serde::{Deserialize, Serialize};

use super::model::{ObjectId, Value};
use crate::codec::{self, CodecError};
use crate::credentials::Credential;
use crate::timeframe::Timeframe;

/// A change to the object model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Set a key of the root document
    Set { key: String, value: Value },
    Delete { key: String },
    CreateObject {
        id: ObjectId,
        kind: String,
        parent: Option<ObjectId>,
    },
    SetProperty {
        id: ObjectId,
        key: String,
        value: Value,
    },
    DeleteObject { id: ObjectId },
    CreateLink {
        id: ObjectId,
        kind: String,
        source: ObjectId,
        target: ObjectId,
    },
}

impl Mutation {
    pub fn set(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Mutation::Set {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Credential(Credential),
    Mutation(Mutation),
}

/// The record stored in every feed block of a space
///
/// `timeframe` is what the writer had processed when it wrote, i.e. the
/// causal dependencies of this message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceMessage {
    pub timeframe: Timeframe,
    pub payload: Payload,
}

impl SpaceMessage {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        codec::decode(bytes)
    }
}
