use std::{collections::HashMap, sync::Arc, time::Duration};

use derive_where::derive_where;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    bson::{doc, Document},
    error::{ErrorKind, Result},
    options::ServerAddress,
    sdam::public::ServerInfo,
    serde_util,
};

/// Describes which servers are suitable for a given operation.
#[derive_where(Debug)]
#[derive(Clone)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// A read preference that describes the suitable servers based on the server type, max
    /// staleness, and server tags.
    ReadPreference(ReadPreference),

    /// A predicate used to filter servers that are considered suitable. A `server` will be
    /// considered suitable by a `predicate` if `predicate(server)` returns true.
    Predicate(#[derive_where(skip)] Predicate),
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(r1), Self::ReadPreference(r2)) => r1 == r2,
            (Self::Predicate(p1), Self::Predicate(p2)) => Arc::ptr_eq(p1, p2),
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(ref read_pref) => Some(read_pref),
            Self::Predicate(..) => None,
        }
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.as_read_pref().and_then(|pref| pref.max_staleness())
    }

    pub(crate) fn from_address(address: ServerAddress) -> Self {
        SelectionCriteria::Predicate(Arc::new(move |server| server.address() == &address))
    }
}

/// A predicate used to filter servers that are considered suitable.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerInfo) -> bool>;

/// Specifies how the driver should route a read operation to members of a replica set.
///
/// If applicable, `tag_sets` can be used to target specific nodes in a replica set, and
/// `max_staleness` specifies the maximum lag behind the primary that a secondary can be to
/// remain eligible for the operation. The max staleness value maps to the `maxStalenessSeconds`
/// URI option and is sent to the server as an integer number of seconds.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Only route this operation to a secondary.
    Secondary {
        /// Specify this read preference's options.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to the primary if it's available, but fall back to the secondaries
    /// if not.
    PrimaryPreferred {
        /// Specify this read preference's options.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to a secondary if one is available, but fall back to the primary if
    /// not.
    SecondaryPreferred {
        /// Specify this read preference's options.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to the node with the least network latency regardless of whether
    /// it's the primary or a secondary.
    Nearest {
        /// Specify this read preference's options.
        options: ReadPreferenceOptions,
    },
}

/// Specifies read preference options for non-primary read preferences.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Specifies which replica set members should be considered for operations. Each tag set
    /// will be checked in order until one or more servers is found with each tag in the set.
    #[serde(skip_serializing_if = "Option::is_none", rename = "tags")]
    pub tag_sets: Option<Vec<TagSet>>,

    /// Specifies the maximum amount of lag behind the primary that a secondary can be to be
    /// considered for the given operation. Any secondaries lagging behind more than
    /// `max_staleness` will not be considered for the operation.
    ///
    /// `max_staleness` must be at least 90 seconds. If a `max_staleness` less than 90 seconds is
    /// specified for an operation, the operation will return an error.
    #[serde(
        rename = "maxStalenessSeconds",
        default,
        serialize_with = "serde_util::serialize_duration_option_as_int_seconds"
    )]
    pub max_staleness: Option<Duration>,
}

impl ReadPreferenceOptions {
    pub(crate) fn is_default(&self) -> bool {
        self.max_staleness.is_none()
            && self
                .tag_sets
                .as_ref()
                .map(|ts| ts.is_empty() || ts.iter().all(|tags| tags.is_empty()))
                .unwrap_or(true)
    }
}

impl ReadPreference {
    pub(crate) fn mode(&self) -> &'static str {
        match self {
            ReadPreference::Primary => "primary",
            ReadPreference::Secondary { .. } => "secondary",
            ReadPreference::PrimaryPreferred { .. } => "primaryPreferred",
            ReadPreference::SecondaryPreferred { .. } => "secondaryPreferred",
            ReadPreference::Nearest { .. } => "nearest",
        }
    }

    pub(crate) fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            ReadPreference::Primary => None,
            ReadPreference::Secondary { ref options }
            | ReadPreference::PrimaryPreferred { ref options }
            | ReadPreference::SecondaryPreferred { ref options }
            | ReadPreference::Nearest { ref options } => Some(options),
        }
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.options().and_then(|options| options.max_staleness)
    }

    pub(crate) fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        self.options().and_then(|options| options.tag_sets.as_ref())
    }

    /// Constructs a read preference from the mode, tag sets, and max staleness parsed out of a
    /// connection string.
    pub(crate) fn from_mode(
        mode: &str,
        tag_sets: Option<Vec<TagSet>>,
        max_staleness: Option<Duration>,
    ) -> Result<Self> {
        let options = ReadPreferenceOptions::builder()
            .tag_sets(tag_sets.clone())
            .max_staleness(max_staleness)
            .build();

        let read_pref = match &mode.to_lowercase()[..] {
            "primary" => {
                if tag_sets.is_some() {
                    return Err(ErrorKind::InvalidArgument {
                        message: "read preference tags can only be specified when a non-primary \
                                  mode is specified"
                            .to_string(),
                    }
                    .into());
                }
                if max_staleness.is_some() {
                    return Err(ErrorKind::InvalidArgument {
                        message: "max staleness can only be specified when a non-primary mode is \
                                  specified"
                            .to_string(),
                    }
                    .into());
                }
                ReadPreference::Primary
            }
            "primarypreferred" => ReadPreference::PrimaryPreferred { options },
            "secondary" => ReadPreference::Secondary { options },
            "secondarypreferred" => ReadPreference::SecondaryPreferred { options },
            "nearest" => ReadPreference::Nearest { options },
            other => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("Unknown read preference mode: {}", other),
                }
                .into())
            }
        };

        Ok(read_pref)
    }

    pub(crate) fn into_document(self) -> Document {
        let mut doc = doc! { "mode": self.mode() };
        if let Some(options) = self.options() {
            if let Some(max_stale) = options.max_staleness {
                doc.insert("maxStalenessSeconds", max_stale.as_secs() as i64);
            }

            if let Some(tag_sets) = options.tag_sets.as_ref() {
                let tags: Vec<_> = tag_sets
                    .iter()
                    .map(|tag_set| {
                        crate::bson::Bson::Document(
                            tag_set
                                .iter()
                                .map(|(k, v)| (k.clone(), crate::bson::Bson::String(v.clone())))
                                .collect(),
                        )
                    })
                    .collect();
                doc.insert("tags", tags);
            }
        }
        doc
    }
}

/// A read preference tag set. See the documentation [here](https://www.mongodb.com/docs/manual/tutorial/configure-replica-set-tag-sets/)
/// for more details.
pub type TagSet = HashMap<String, String>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn primary_mode_rejects_tags_and_staleness() {
        let mut tags = TagSet::new();
        tags.insert("dc".to_string(), "ny".to_string());

        assert!(ReadPreference::from_mode("primary", Some(vec![tags]), None).is_err());
        assert!(
            ReadPreference::from_mode("primary", None, Some(Duration::from_secs(120))).is_err()
        );
        assert!(ReadPreference::from_mode("primary", None, None).is_ok());
    }

    #[test]
    fn mode_parsing_is_case_insensitive() {
        let pref = ReadPreference::from_mode("SecondaryPreferred", None, None).unwrap();
        assert!(matches!(pref, ReadPreference::SecondaryPreferred { .. }));
        assert!(ReadPreference::from_mode("closest", None, None).is_err());
    }

    #[test]
    fn read_preference_document_shape() {
        let mut tags = TagSet::new();
        tags.insert("dc".to_string(), "ny".to_string());
        let pref = ReadPreference::Nearest {
            options: ReadPreferenceOptions::builder()
                .tag_sets(vec![tags])
                .max_staleness(Duration::from_secs(120))
                .build(),
        };
        let doc = pref.into_document();
        assert_eq!(doc.get_str("mode").unwrap(), "nearest");
        assert_eq!(doc.get_i64("maxStalenessSeconds").unwrap(), 120);
        assert!(doc.get_array("tags").is_ok());
    }
}
