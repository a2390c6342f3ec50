use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::Mutation;
use crate::codec::{self, CodecError};
use crate::crypto::{hash_parts, BLAKE3_HASH_SIZE};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(Uuid);

impl ObjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ObjectId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A property value in the object model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Reference to another object
    Ref(ObjectId),
}

impl Value {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(bytes) => serde_json::Value::String(hex::encode(bytes)),
            Value::Ref(id) => serde_json::json!({ "$ref": id.to_string() }),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Object {
    pub id: ObjectId,
    pub kind: String,
    pub parent: Option<ObjectId>,
    /// `(source, target)` when the object is a link
    pub link: Option<(ObjectId, ObjectId)>,
    pub properties: BTreeMap<String, Value>,
    pub deleted: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("unknown object {0}")]
    UnknownObject(ObjectId),
    #[error("object {0} already exists")]
    ObjectExists(ObjectId),
    #[error("object {0} was deleted")]
    Deleted(ObjectId),
}

/// The materialized state of a space
///
/// A root document of key/value pairs plus an arena of objects keyed by
/// id. Parents and links refer to other objects by id only.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ObjectModel {
    root: BTreeMap<String, Value>,
    objects: BTreeMap<ObjectId, Object>,
}

impl ObjectModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, mutation: &Mutation) -> Result<(), ModelError> {
        match mutation {
            Mutation::Set { key, value } => {
                self.root.insert(key.clone(), value.clone());
            }
            Mutation::Delete { key } => {
                self.root.remove(key);
            }
            Mutation::CreateObject { id, kind, parent } => {
                if self.objects.contains_key(id) {
                    return Err(ModelError::ObjectExists(*id));
                }
                if let Some(parent) = parent {
                    self.live(parent)?;
                }
                self.objects.insert(
                    *id,
                    Object {
                        id: *id,
                        kind: kind.clone(),
                        parent: *parent,
                        link: None,
                        properties: BTreeMap::new(),
                        deleted: false,
                    },
                );
            }
            Mutation::SetProperty { id, key, value } => {
                self.live(id)?;
                if let Some(object) = self.objects.get_mut(id) {
                    object.properties.insert(key.clone(), value.clone());
                }
            }
            Mutation::DeleteObject { id } => {
                self.live(id)?;
                if let Some(object) = self.objects.get_mut(id) {
                    object.deleted = true;
                }
            }
            Mutation::CreateLink {
                id,
                kind,
                source,
                target,
            } => {
                if self.objects.contains_key(id) {
                    return Err(ModelError::ObjectExists(*id));
                }
                self.live(source)?;
                self.live(target)?;
                self.objects.insert(
                    *id,
                    Object {
                        id: *id,
                        kind: kind.clone(),
                        parent: None,
                        link: Some((*source, *target)),
                        properties: BTreeMap::new(),
                        deleted: false,
                    },
                );
            }
        }
        Ok(())
    }

    fn live(&self, id: &ObjectId) -> Result<&Object, ModelError> {
        match self.objects.get(id) {
            Some(object) if object.deleted => Err(ModelError::Deleted(*id)),
            Some(object) => Ok(object),
            None => Err(ModelError::UnknownObject(*id)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    pub fn root(&self) -> &BTreeMap<String, Value> {
        &self.root
    }

    /// A live (not deleted) object
    pub fn object(&self, id: &ObjectId) -> Option<&Object> {
        self.live(id).ok()
    }

    pub fn objects(&self) -> impl Iterator<Item = &Object> {
        self.objects.values().filter(|object| !object.deleted)
    }

    pub fn children(&self, parent: &ObjectId) -> Vec<&Object> {
        self.objects()
            .filter(|object| object.parent.as_ref() == Some(parent))
            .collect()
    }

    /// Live links whose source is `source` and whose target is still live
    pub fn links_from(&self, source: &ObjectId) -> Vec<&Object> {
        self.objects()
            .filter(|object| {
                object
                    .link
                    .is_some_and(|(from, to)| from == *source && self.object(&to).is_some())
            })
            .collect()
    }

    /// The root document as JSON
    pub fn document(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.root
                .iter()
                .map(|(key, value)| (key.clone(), value.to_json()))
                .collect(),
        )
    }

    /// Root document plus live objects as JSON
    pub fn to_json(&self) -> serde_json::Value {
        let objects: serde_json::Map<String, serde_json::Value> = self
            .objects()
            .map(|object| {
                let properties: serde_json::Map<String, serde_json::Value> = object
                    .properties
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect();
                (
                    object.id.to_string(),
                    serde_json::json!({
                        "kind": object.kind,
                        "parent": object.parent.map(|p| p.to_string()),
                        "link": object.link.map(|(s, t)| [s.to_string(), t.to_string()]),
                        "properties": properties,
                    }),
                )
            })
            .collect();
        serde_json::json!({ "root": self.document(), "objects": objects })
    }

    /// Hash of the canonical encoding; equal models have equal digests
    pub fn digest(&self) -> Result<[u8; BLAKE3_HASH_SIZE], CodecError> {
        Ok(hash_parts(&[&codec::encode(self)?]))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_root_document() {
        let mut model = ObjectModel::new();
        model
            .apply(&Mutation::Set {
                key: "title".into(),
                value: "Hello".into(),
            })
            .unwrap();
        model
            .apply(&Mutation::Set {
                key: "draft".into(),
                value: true.into(),
            })
            .unwrap();
        model
            .apply(&Mutation::Delete {
                key: "draft".into(),
            })
            .unwrap();
        assert_eq!(model.document(), serde_json::json!({ "title": "Hello" }));
    }

    #[test]
    fn test_object_graph() {
        let mut model = ObjectModel::new();
        let (folder, note, link) = (ObjectId::new(), ObjectId::new(), ObjectId::new());

        model
            .apply(&Mutation::CreateObject {
                id: folder,
                kind: "folder".into(),
                parent: None,
            })
            .unwrap();
        model
            .apply(&Mutation::CreateObject {
                id: note,
                kind: "note".into(),
                parent: Some(folder),
            })
            .unwrap();
        model
            .apply(&Mutation::SetProperty {
                id: note,
                key: "body".into(),
                value: "text".into(),
            })
            .unwrap();
        model
            .apply(&Mutation::CreateLink {
                id: link,
                kind: "mentions".into(),
                source: folder,
                target: note,
            })
            .unwrap();

        assert_eq!(model.children(&folder).len(), 1);
        assert_eq!(model.links_from(&folder).len(), 1);
        assert_eq!(
            model.apply(&Mutation::CreateObject {
                id: note,
                kind: "note".into(),
                parent: None
            }),
            Err(ModelError::ObjectExists(note))
        );

        model.apply(&Mutation::DeleteObject { id: note }).unwrap();
        assert!(model.object(&note).is_none());
        assert!(model.links_from(&folder).is_empty());
        assert_eq!(
            model.apply(&Mutation::SetProperty {
                id: note,
                key: "body".into(),
                value: Value::Null
            }),
            Err(ModelError::Deleted(note))
        );
    }

    #[test]
    fn test_digest_tracks_content() {
        let mut a = ObjectModel::new();
        let mut b = ObjectModel::new();
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());

        a.apply(&Mutation::Set {
            key: "n".into(),
            value: 1i64.into(),
        })
        .unwrap();
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
        b.apply(&Mutation::Set {
            key: "n".into(),
            value: 1i64.into(),
        })
        .unwrap();
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
    }
}
