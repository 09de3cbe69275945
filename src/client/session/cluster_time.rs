use serde::{Deserialize, Serialize};

use crate::bson::{Document, Timestamp};

/// Struct modeling a cluster time reported by the server.
///
/// See [the server documentation](https://www.mongodb.com/docs/manual/core/read-isolation-consistency-recency/)
/// for more information.
#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ClusterTime {
    pub(crate) cluster_time: Timestamp,
    pub(crate) signature: Document,
}

impl std::cmp::PartialEq for ClusterTime {
    fn eq(&self, other: &ClusterTime) -> bool {
        self.cluster_time == other.cluster_time
    }
}

impl std::cmp::Eq for ClusterTime {}

impl std::cmp::Ord for ClusterTime {
    fn cmp(&self, other: &ClusterTime) -> std::cmp::Ordering {
        let lhs = (self.cluster_time.time, self.cluster_time.increment);
        let rhs = (other.cluster_time.time, other.cluster_time.increment);
        lhs.cmp(&rhs)
    }
}

impl std::cmp::PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &ClusterTime) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::doc;

    fn cluster_time(time: u32, increment: u32) -> ClusterTime {
        ClusterTime {
            cluster_time: Timestamp { time, increment },
            signature: doc! {},
        }
    }

    #[test]
    fn ordering_ignores_signature() {
        let mut early = cluster_time(100, 1);
        early.signature = doc! { "keyId": 42_i64 };
        let late = cluster_time(100, 2);

        assert!(early < late);
        assert!(cluster_time(99, 9) < cluster_time(100, 1));
        assert_eq!(cluster_time(100, 1), cluster_time(100, 1));
    }
}
