#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub use ::bson;

pub mod bulk;
mod bson_util;
mod client;
mod cmap;
mod compression;
mod concern;
mod cursor;
pub mod error;
pub mod event;
mod hello;
mod operation;
pub mod options;
pub(crate) mod runtime;
mod sdam;
mod selection_criteria;
mod serde_util;

pub use crate::{
    client::{session::ClientSession, Client},
    concern::{Acknowledgment, ReadConcern, WriteConcern},
    cursor::CursorSpecification,
    selection_criteria::{ReadPreference, ReadPreferenceOptions, SelectionCriteria, TagSet},
};

pub use client::session::ClusterTime;
pub use cmap::ConnectionInfo;
pub use event::MonitoringRegistry;
pub use operation::InsertManyResult;
pub use sdam::public::{ServerInfo, ServerType, TopologyType};

/// A convenience for fully-qualified collection names, split into the
/// database and collection parts.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Namespace {
    /// The database name.
    pub db: String,

    /// The collection name.
    pub coll: String,
}

impl Namespace {
    /// Construct a `Namespace` from database and collection names.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    pub(crate) fn from_str(s: &str) -> Option<Self> {
        let (db, coll) = s.split_once('.')?;
        if db.is_empty() || coll.is_empty() {
            return None;
        }
        Some(Self {
            db: db.to_string(),
            coll: coll.to_string(),
        })
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl<'de> serde::Deserialize<'de> for Namespace {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Self::from_str(&s)
            .ok_or_else(|| serde::de::Error::custom("namespace must be of the form <db>.<coll>"))
    }
}

impl serde::Serialize for Namespace {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
