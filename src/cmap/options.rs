use std::time::Duration;

use derive_where::derive_where;
use serde::Deserialize;

use crate::{client::auth::Credential, options::ClientOptions};

/// Contains the options for creating a connection pool.
#[derive_where(Debug)]
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionPoolOptions {
    /// The credential to use for authenticating connections in this pool.
    #[serde(skip)]
    #[derive_where(skip)]
    pub(crate) credential: Option<Credential>,

    /// Whether or not the client is connecting to the deployment through a load balancer.
    #[serde(skip)]
    pub(crate) load_balanced: Option<bool>,

    /// The amount of time a connection can remain idle in a connection pool before being closed.
    /// A value of zero indicates that connections should not be closed due to being idle.
    ///
    /// By default, connections will not be closed due to being idle.
    #[serde(rename = "maxIdleTimeMS", default)]
    #[serde(deserialize_with = "crate::serde_util::deserialize_duration_option_from_u64_millis")]
    pub max_idle_time: Option<Duration>,

    /// The maximum number of connections that the pool can manage, including connections which
    /// are currently checked out of the pool.
    ///
    /// The default is 100.
    pub max_pool_size: Option<u32>,

    /// The minimum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool. If fewer than `min_pool_size`
    /// connections are in the pool, connections will be added to the pool in the background.
    ///
    /// The default is that no minimum is enforced.
    pub min_pool_size: Option<u32>,

    /// The maximum number of new connections that can be created concurrently.
    ///
    /// The default is 2.
    pub max_connecting: Option<u32>,

    /// The amount of time a checkout request can wait for a connection to become available
    /// before timing out.
    #[serde(rename = "waitQueueTimeoutMS", default)]
    #[serde(deserialize_with = "crate::serde_util::deserialize_duration_option_from_u64_millis")]
    pub wait_queue_timeout: Option<Duration>,

    /// Interval between background maintenance passes, overridden in tests.
    #[cfg(test)]
    #[serde(skip)]
    pub(crate) background_thread_interval: Option<BackgroundThreadInterval>,

    /// Whether the pool should start in the ready state rather than waiting for the first
    /// successful monitor check. Used in tests.
    #[cfg(test)]
    #[serde(skip)]
    pub(crate) ready: Option<bool>,
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum BackgroundThreadInterval {
    Never,
    Every(Duration),
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            credential: options.credential.clone(),
            load_balanced: options.load_balanced,
            max_idle_time: options.max_idle_time,
            max_pool_size: options.max_pool_size,
            min_pool_size: options.min_pool_size,
            max_connecting: options.max_connecting,
            wait_queue_timeout: options
                .wait_queue_timeout
                .or(options.server_selection_timeout),
            #[cfg(test)]
            background_thread_interval: None,
            #[cfg(test)]
            ready: None,
        }
    }
}
