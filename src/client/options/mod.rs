#[cfg(test)]
mod test;

use std::{
    borrow::Cow,
    collections::HashMap,
    fmt::{self, Display, Formatter, Write},
    hash::{Hash, Hasher},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    client::auth::{AuthMechanism, Credential},
    compression::Compressor,
    concern::{Acknowledgment, ReadConcern, WriteConcern},
    error::{Error, ErrorKind, Result},
    event::MonitoringRegistry,
    sdam::{verify_max_staleness, DEFAULT_HEARTBEAT_FREQUENCY, MIN_HEARTBEAT_FREQUENCY},
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

const DEFAULT_PORT: u16 = 27017;

/// An enum representing the address of a server.
#[derive(Clone, Debug, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address where the server can be found.
        host: String,

        /// The TCP port that the server is listening on.
        ///
        /// The default is 27017.
        port: Option<u16>,
    },
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Tcp { host, port },
                Self::Tcp {
                    host: other_host,
                    port: other_port,
                },
            ) => {
                host == other_host
                    && port.unwrap_or(DEFAULT_PORT) == other_port.unwrap_or(DEFAULT_PORT)
            }
        }
    }
}

impl Hash for ServerAddress {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        match self {
            Self::Tcp { host, port } => {
                host.hash(state);
                port.unwrap_or(DEFAULT_PORT).hash(state);
            }
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;
    fn from_str(address: &str) -> Result<Self> {
        ServerAddress::parse(address)
    }
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`. Hostnames are canonicalized to
    /// lowercase, since address equality is case-insensitive.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');

        let hostname = match parts.next() {
            Some(part) => {
                if part.is_empty() {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!(
                            "invalid server address: \"{}\"; hostname cannot be empty",
                            address
                        ),
                    }
                    .into());
                }
                part
            }
            None => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("invalid server address: \"{}\"", address),
                }
                .into())
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port = u16::from_str(part).map_err(|_| ErrorKind::InvalidArgument {
                    message: format!(
                        "port must be valid 16-bit unsigned integer, instead got: {}",
                        part
                    ),
                })?;

                if port == 0 {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!(
                            "invalid server address: \"{}\"; port must be non-zero",
                            address
                        ),
                    }
                    .into());
                }
                if parts.next().is_some() {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!(
                            "address \"{}\" contains more than one unescaped ':'",
                            address
                        ),
                    }
                    .into());
                }

                Some(port)
            }
            None => None,
        };

        Ok(ServerAddress::Tcp {
            host: hostname.to_lowercase(),
            port,
        })
    }

    pub(crate) fn host(&self) -> Cow<'_, str> {
        match self {
            Self::Tcp { host, .. } => Cow::Borrowed(host.as_str()),
        }
    }

    pub(crate) fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => *port,
        }
    }

    pub(crate) fn into_lookup_arg(self) -> (String, u16) {
        match self {
            Self::Tcp { host, port } => (host, port.unwrap_or(DEFAULT_PORT)),
        }
    }
}

impl Display for ServerAddress {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                write!(fmt, "{}:{}", host, port.unwrap_or(DEFAULT_PORT))
            }
        }
    }
}

/// Specifies whether TLS configuration should be used with the operations that the
/// [`Client`](crate::Client) performs.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
#[allow(clippy::large_enum_variant)]
pub enum Tls {
    /// Enable TLS with the specified options.
    Enabled(TlsOptions),

    /// Disable TLS.
    Disabled,
}

impl From<TlsOptions> for Tls {
    fn from(options: TlsOptions) -> Self {
        Self::Enabled(options)
    }
}

/// Specifies the TLS configuration that the [`Client`](crate::Client) should use.
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct TlsOptions {
    /// Whether or not the [`Client`](crate::Client) should return an error if the server
    /// presents an invalid certificate. This setting should _not_ be set to `true` in
    /// production; it should only be used for testing.
    ///
    /// The default value is to error when the server presents an invalid certificate.
    pub allow_invalid_certificates: Option<bool>,

    /// The path to the CA file that the [`Client`](crate::Client) should use for TLS. If none is
    /// specified, then the driver will use the Mozilla root certificates from the `webpki-roots`
    /// crate.
    pub ca_file_path: Option<PathBuf>,

    /// The path to the certificate file that the [`Client`](crate::Client) should present to
    /// the server to verify its identity. The file must contain the client certificate followed
    /// by its PEM-encoded private key. If none is specified, then the
    /// [`Client`](crate::Client) will not attempt to verify its identity to the server.
    pub cert_key_file_path: Option<PathBuf>,
}

/// Contains the options that can be used to create a new [`Client`](crate::Client).
#[derive(Clone, Debug, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(default)]
#[non_exhaustive]
pub struct ClientOptions {
    /// The initial list of seeds that the Client should connect to.
    ///
    /// Note that by default, the driver will autodiscover other nodes in the cluster. To connect
    /// directly to a single server (rather than autodiscovering the rest of the cluster), set
    /// the `direct_connection` field to `true`.
    #[builder(default_code = "vec![ServerAddress::Tcp {
        host: \"localhost\".to_string(),
        port: Some(27017),
    }]")]
    #[serde(default = "default_hosts")]
    pub hosts: Vec<ServerAddress>,

    /// The application name that the Client will send to the server as part of the handshake.
    /// This can be used in combination with the server logs to determine which Client is
    /// connected to a server.
    pub app_name: Option<String>,

    /// The compressors that the Client is willing to use in the order they are specified in the
    /// configuration. The Client sends this list of compressors to the server. The server
    /// responds with the intersection of its supported list of compressors, and the first
    /// compressor in common is used for traffic on the connection.
    #[serde(skip)]
    pub compressors: Option<Vec<Compressor>>,

    /// The connect timeout passed to each underlying TcpStream when attempting to connect to
    /// the server.
    ///
    /// The default value is 10 seconds.
    pub connect_timeout: Option<Duration>,

    /// The credential to use for authenticating connections made by this client.
    pub credential: Option<Credential>,

    /// Specifies whether the Client should directly connect to a single host rather than
    /// autodiscover all servers in the cluster.
    ///
    /// The default value is false.
    pub direct_connection: Option<bool>,

    /// Extra information to append to the driver version in the metadata of the handshake with
    /// the server. This should be used by libraries wrapping the driver, e.g. ODMs.
    pub driver_info: Option<DriverInfo>,

    /// The amount of time each monitoring task should wait between sending a hello command
    /// to its respective server.
    ///
    /// The default value is 10 seconds.
    pub heartbeat_freq: Option<Duration>,

    /// Whether or not the client is connecting to the deployment through a load balancer.
    pub load_balanced: Option<bool>,

    /// When running a read operation with a ReadPreference that allows selecting secondaries,
    /// `local_threshold` is used to determine how much longer the average round trip time
    /// between the driver and server is allowed compared to the least round trip time of all
    /// the suitable servers. For example, if the average round trip times of the suitable
    /// servers are 5 ms, 10 ms, and 15 ms, and the local threshold is 8 ms, then the first two
    /// servers are within the latency window and could be chosen for the operation, but the
    /// last one is not.
    ///
    /// A value of zero indicates that there is no latency window, so only the server with the
    /// lowest average round trip time is eligible.
    ///
    /// The default value is 15 ms.
    pub local_threshold: Option<Duration>,

    /// The amount of time that a connection can remain idle in a connection pool before being
    /// closed. A value of zero indicates that connections should not be closed due to being
    /// idle.
    ///
    /// By default, connections will not be closed due to being idle.
    pub max_idle_time: Option<Duration>,

    /// The maximum amount of connections that the Client should allow to be created in a
    /// connection pool for a given server. If an operation is attempted on a server while
    /// `max_pool_size` connections are checked out, the operation will block until an
    /// in-progress operation finishes and its connection is checked back into the pool.
    ///
    /// The default value is 100.
    pub max_pool_size: Option<u32>,

    /// The minimum number of connections that should be available in a server's connection pool
    /// at a given time. If fewer than `min_pool_size` connections are in the pool, connections
    /// will be added to the pool in the background until `min_pool_size` is reached.
    ///
    /// The default value is 0.
    pub min_pool_size: Option<u32>,

    /// The maximum number of new connections that can be created concurrently per pool.
    ///
    /// The default value is 2.
    pub max_connecting: Option<u32>,

    /// The amount of time that a checkout request can wait for a connection to become
    /// available before timing out.
    ///
    /// The default is the server selection timeout.
    pub wait_queue_timeout: Option<Duration>,

    /// The registry of monitoring subscribers that should observe this client's command, SDAM,
    /// and connection pool events. Handlers registered on the registry before client
    /// construction are guaranteed to observe the topology-opening sequence.
    #[serde(skip)]
    pub monitoring: Option<MonitoringRegistry>,

    /// Suppresses the emission of command started/succeeded/failed events.
    ///
    /// This switch only affects command-level monitoring; heartbeats, topology events, and pool
    /// events are unaffected, since the driver cannot function without them.
    pub command_events_disabled: Option<bool>,

    /// Specifies the default read concern for operations performed on the Client. See the
    /// ReadConcern type documentation for more details.
    pub read_concern: Option<ReadConcern>,

    /// The name of the replica set that the Client should connect to.
    pub repl_set_name: Option<String>,

    /// Whether or not the client should retry a read operation if the operation fails.
    ///
    /// The default value is true.
    pub retry_reads: Option<bool>,

    /// Whether or not the client should retry a write operation if the operation fails.
    ///
    /// The default value is true.
    pub retry_writes: Option<bool>,

    /// The default selection criteria for operations performed on the Client. See the
    /// SelectionCriteria type documentation for more details.
    #[serde(skip)]
    pub selection_criteria: Option<SelectionCriteria>,

    /// The amount of time the Client should attempt to select a server for an operation before
    /// timing out.
    ///
    /// The default value is 30 seconds.
    pub server_selection_timeout: Option<Duration>,

    /// Whether server selection should make a single scan of the topology and fail immediately
    /// if no suitable server is found, rather than waiting for the topology to change.
    ///
    /// The default value is false.
    pub server_selection_try_once: Option<bool>,

    /// The default database for this client.
    pub default_database: Option<String>,

    /// The TLS configuration for the Client to use in its connections with the server.
    ///
    /// By default, TLS is disabled.
    #[serde(skip)]
    pub tls: Option<Tls>,

    /// Specifies the default write concern for operations performed on the Client. See the
    /// WriteConcern type documentation for more details.
    pub write_concern: Option<WriteConcern>,

    /// Level for the zlib compressor, when requested.
    #[serde(skip)]
    pub(crate) zlib_compression_level: Option<i32>,

    #[builder(setter(skip))]
    #[serde(skip)]
    pub(crate) socket_timeout: Option<Duration>,

    #[cfg(test)]
    #[builder(setter(skip))]
    #[serde(skip)]
    pub(crate) test_options: Option<TestOptions>,
}

fn default_hosts() -> Vec<ServerAddress> {
    vec![ServerAddress::Tcp {
        host: "localhost".to_string(),
        port: Some(DEFAULT_PORT),
    }]
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Overrides used only by this crate's test suites.
#[cfg(test)]
#[derive(Clone, Debug, Default)]
pub(crate) struct TestOptions {
    /// Override the minimum amount of time monitors must wait between checks.
    pub(crate) min_heartbeat_freq: Option<Duration>,

    /// Skip starting monitor tasks altogether, leaving the topology static.
    pub(crate) disable_monitoring_tasks: bool,
}

#[cfg(test)]
impl ClientOptions {
    pub(crate) fn test_options_mut(&mut self) -> &mut TestOptions {
        self.test_options.get_or_insert_with(Default::default)
    }
}

impl ClientOptions {
    /// Parses a connection string into a `ClientOptions` struct.
    ///
    /// The format of a connection string is described [here](https://www.mongodb.com/docs/manual/reference/connection-string/#connection-string-formats).
    pub async fn parse(uri: impl AsRef<str>) -> Result<Self> {
        let connection_string: ConnectionString = uri.as_ref().parse()?;
        let options: Self = connection_string.try_into()?;
        options.validate()?;
        Ok(options)
    }

    pub(crate) fn tls_options(&self) -> Option<TlsOptions> {
        match self.tls {
            Some(Tls::Enabled(ref opts)) => Some(opts.clone()),
            _ => None,
        }
    }

    /// Ensure the options set are valid as a whole.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "ClientOptions contains no hosts".to_string(),
            }
            .into());
        }

        if let Some(true) = self.direct_connection {
            if self.hosts.len() > 1 {
                return Err(ErrorKind::InvalidArgument {
                    message: "cannot specify multiple seeds with directConnection=true"
                        .to_string(),
                }
                .into());
            }
        }

        if let Some(true) = self.load_balanced {
            if self.hosts.len() > 1 {
                return Err(ErrorKind::InvalidArgument {
                    message: "cannot specify multiple seeds with loadBalanced=true".to_string(),
                }
                .into());
            }

            if self.repl_set_name.is_some() {
                return Err(ErrorKind::InvalidArgument {
                    message: "cannot specify replicaSet with loadBalanced=true".to_string(),
                }
                .into());
            }

            if let Some(true) = self.direct_connection {
                return Err(ErrorKind::InvalidArgument {
                    message: "cannot specify directConnection=true with loadBalanced=true"
                        .to_string(),
                }
                .into());
            }
        }

        if let Some(ref write_concern) = self.write_concern {
            write_concern.validate()?;
        }

        if let Some(heartbeat_freq) = self.heartbeat_freq {
            if heartbeat_freq < MIN_HEARTBEAT_FREQUENCY {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "heartbeatFrequencyMS cannot be less than {}ms",
                        MIN_HEARTBEAT_FREQUENCY.as_millis()
                    ),
                }
                .into());
            }
        }

        if let Some(SelectionCriteria::ReadPreference(ref rp)) = self.selection_criteria {
            if let Some(max_staleness) = rp.max_staleness() {
                verify_max_staleness(
                    max_staleness,
                    self.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY),
                )?;
            }
        }

        if let Some(0) = self.max_pool_size {
            return Err(ErrorKind::InvalidArgument {
                message: "cannot specify maxPoolSize=0".to_string(),
            }
            .into());
        }

        if let (Some(max), Some(min)) = (self.max_pool_size, self.min_pool_size) {
            if max < min {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "minPoolSize ({}) is invalid because it is larger than maxPoolSize ({})",
                        min, max
                    ),
                }
                .into());
            }
        }

        if let Some(ref credential) = self.credential {
            if let Some(ref mechanism) = credential.mechanism {
                mechanism.validate_credential(credential)?;
            }
        }

        if let Some(ref compressors) = self.compressors {
            for compressor in compressors {
                compressor.validate()?;
            }
        }

        Ok(())
    }
}

/// A parsed connection string. This is an intermediate form; `ClientOptions::parse` is the
/// user-facing entrypoint.
#[derive(Debug, Default)]
pub(crate) struct ConnectionString {
    hosts: Vec<ServerAddress>,
    auth_source: Option<String>,
    username: Option<String>,
    password: Option<String>,
    default_database: Option<String>,
    options: HashMap<String, String>,
}

impl FromStr for ConnectionString {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ConnectionString::parse_uri(s)
    }
}

const SCHEME: &str = "docdb://";

impl ConnectionString {
    fn parse_uri(uri: &str) -> Result<Self> {
        let without_scheme = uri.strip_prefix(SCHEME).ok_or_else(|| {
            Error::from(ErrorKind::InvalidArgument {
                message: format!("connection string must start with '{}'", SCHEME),
            })
        })?;

        let (user_info, after_credentials) = match without_scheme.rfind('@') {
            Some(index) => {
                let (creds, rest) = without_scheme.split_at(index);
                (Some(creds), &rest[1..])
            }
            None => (None, without_scheme),
        };

        let (hosts_str, path_and_options) = match after_credentials.find(['/', '?']) {
            Some(index) if after_credentials.as_bytes()[index] == b'/' => {
                let (hosts, rest) = after_credentials.split_at(index);
                (hosts, Some(&rest[1..]))
            }
            Some(_) => {
                // A '?' without a '/' before it is not a valid URI path delimiter.
                return Err(ErrorKind::InvalidArgument {
                    message: "connection string options must be preceded by a '/'".to_string(),
                }
                .into());
            }
            None => (after_credentials, None),
        };

        if hosts_str.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "connection string must contain at least one host".to_string(),
            }
            .into());
        }

        let mut hosts = Vec::new();
        for host in hosts_str.split(',') {
            if host.contains('@') {
                return Err(ErrorKind::InvalidArgument {
                    message: "unexpected '@' in host list; credentials must precede the first \
                              host"
                        .to_string(),
                }
                .into());
            }
            hosts.push(ServerAddress::parse(host)?);
        }

        let (default_database, options_str) = match path_and_options {
            Some(path_and_options) => match path_and_options.split_once('?') {
                Some((db, options)) => (Some(db), Some(options)),
                None => (Some(path_and_options), None),
            },
            None => (None, None),
        };

        let default_database = match default_database {
            Some("") | None => None,
            Some(db) => Some(percent_decode(db, "database name must be URL encoded")?),
        };

        let mut parsed = Self {
            hosts,
            default_database,
            ..Default::default()
        };

        if let Some(user_info) = user_info {
            let (username, password) = match user_info.split_once(':') {
                Some((username, password)) => (username, Some(password)),
                None => (user_info, None),
            };

            for &(part, description) in
                &[(username, "username"), (password.unwrap_or(""), "password")]
            {
                if part.chars().any(|c| ['@', '/', ':'].contains(&c)) {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!("{} cannot contain unescaped @, / or :", description),
                    }
                    .into());
                }
            }

            if !username.is_empty() {
                parsed.username = Some(percent_decode(
                    username,
                    "username must be URL encoded",
                )?);
            }
            parsed.password = password
                .map(|p| percent_decode(p, "password must be URL encoded"))
                .transpose()?;
        }

        if let Some(options_str) = options_str {
            parsed.parse_options(options_str)?;
        }

        Ok(parsed)
    }

    fn parse_options(&mut self, options_str: &str) -> Result<()> {
        if options_str.is_empty() {
            return Ok(());
        }

        for option_pair in options_str.split('&') {
            let (key, value) = option_pair.split_once('=').ok_or_else(|| {
                Error::from(ErrorKind::InvalidArgument {
                    message: format!(
                        "connection string options must be of the form key=value: {}",
                        option_pair
                    ),
                })
            })?;

            let normalized_key = key.to_lowercase();
            if self
                .options
                .insert(normalized_key, value.to_string())
                .is_some()
            {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("duplicate connection string option: {}", key),
                }
                .into());
            }
        }

        if let Some(auth_source) = self.options.remove("authsource") {
            if auth_source.is_empty() {
                return Err(ErrorKind::InvalidArgument {
                    message: "authSource cannot be empty".to_string(),
                }
                .into());
            }
            self.auth_source = Some(auth_source);
        }

        Ok(())
    }
}

fn percent_decode(s: &str, err_message: &str) -> Result<String> {
    match percent_encoding::percent_decode_str(s).decode_utf8() {
        Ok(result) => Ok(result.to_string()),
        Err(_) => Err(ErrorKind::InvalidArgument {
            message: err_message.to_string(),
        }
        .into()),
    }
}

fn get_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ErrorKind::InvalidArgument {
            message: format!("connection string option {} must be \"true\" or \"false\"", key),
        }
        .into()),
    }
}

fn get_duration_ms(key: &str, value: &str) -> Result<Duration> {
    match u64::from_str(value) {
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(_) => Err(ErrorKind::InvalidArgument {
            message: format!(
                "connection string option {} must be a non-negative integer number of \
                 milliseconds",
                key
            ),
        }
        .into()),
    }
}

fn get_u32(key: &str, value: &str) -> Result<u32> {
    u32::from_str(value).map_err(|_| {
        ErrorKind::InvalidArgument {
            message: format!("connection string option {} must be a non-negative integer", key),
        }
        .into()
    })
}

fn parse_tags(value: &str) -> Result<TagSet> {
    let mut tags = TagSet::new();
    if value.is_empty() {
        return Ok(tags);
    }
    for pair in value.split(',') {
        let (key, value) = pair.split_once(':').ok_or_else(|| {
            Error::from(ErrorKind::InvalidArgument {
                message: format!(
                    "read preference tags must be of the form key:value, instead got {}",
                    pair
                ),
            })
        })?;
        tags.insert(key.to_string(), value.to_string());
    }
    Ok(tags)
}

impl TryFrom<ConnectionString> for ClientOptions {
    type Error = Error;

    fn try_from(mut conn_str: ConnectionString) -> Result<Self> {
        let mut options = ClientOptions::builder().hosts(conn_str.hosts.clone()).build();
        options.default_database = conn_str.default_database.take();

        let mut read_pref_mode: Option<String> = None;
        let mut read_pref_tags: Option<Vec<TagSet>> = None;
        let mut max_staleness: Option<Duration> = None;
        let mut auth_mechanism: Option<AuthMechanism> = None;
        let mut auth_mechanism_properties: Option<crate::bson::Document> = None;
        let mut w: Option<Acknowledgment> = None;
        let mut w_timeout: Option<Duration> = None;
        let mut journal: Option<bool> = None;
        let mut tls_options: Option<TlsOptions> = None;
        let mut tls: Option<bool> = None;
        let mut compressor_names: Option<Vec<String>> = None;

        for (key, value) in conn_str.options.iter() {
            match key.as_str() {
                "appname" => {
                    if value.len() > 128 {
                        return Err(ErrorKind::InvalidArgument {
                            message: "appName cannot exceed 128 bytes".to_string(),
                        }
                        .into());
                    }
                    options.app_name = Some(value.to_string());
                }
                "authmechanism" => {
                    auth_mechanism = Some(AuthMechanism::from_str(value)?);
                }
                "authmechanismproperties" => {
                    let mut doc = crate::bson::Document::new();
                    for kvp in value.split(',') {
                        let (k, v) = kvp.split_once(':').ok_or_else(|| {
                            Error::from(ErrorKind::InvalidArgument {
                                message: "authMechanismProperties must be a comma-separated list \
                                          of colon-separated key-value pairs"
                                    .to_string(),
                            })
                        })?;
                        doc.insert(k, v);
                    }
                    auth_mechanism_properties = Some(doc);
                }
                "compressors" => {
                    compressor_names = Some(value.split(',').map(String::from).collect());
                }
                "connecttimeoutms" => {
                    options.connect_timeout = Some(get_duration_ms(key, value)?);
                }
                "directconnection" => {
                    options.direct_connection = Some(get_bool(key, value)?);
                }
                "heartbeatfrequencyms" => {
                    options.heartbeat_freq = Some(get_duration_ms(key, value)?);
                }
                "journal" => {
                    journal = Some(get_bool(key, value)?);
                }
                "loadbalanced" => {
                    options.load_balanced = Some(get_bool(key, value)?);
                }
                "localthresholdms" => {
                    options.local_threshold = Some(get_duration_ms(key, value)?);
                }
                "maxconnecting" => {
                    options.max_connecting = Some(get_u32(key, value)?);
                }
                "maxidletimems" => {
                    options.max_idle_time = Some(get_duration_ms(key, value)?);
                }
                "maxpoolsize" => {
                    options.max_pool_size = Some(get_u32(key, value)?);
                }
                "maxstalenessseconds" => {
                    let seconds = i64::from_str(value).map_err(|_| {
                        Error::from(ErrorKind::InvalidArgument {
                            message: "maxStalenessSeconds must be an integer".to_string(),
                        })
                    })?;
                    // -1 is the documented "no max staleness" sentinel.
                    max_staleness = match seconds {
                        -1 => None,
                        s if s < 0 => {
                            return Err(ErrorKind::InvalidArgument {
                                message: format!(
                                    "maxStalenessSeconds must be -1 or positive, instead got {}",
                                    s
                                ),
                            }
                            .into())
                        }
                        s => Some(Duration::from_secs(s as u64)),
                    };
                }
                "minpoolsize" => {
                    options.min_pool_size = Some(get_u32(key, value)?);
                }
                "readpreference" => {
                    read_pref_mode = Some(value.to_string());
                }
                "readpreferencetags" => {
                    let tags = parse_tags(value)?;
                    read_pref_tags.get_or_insert_with(Vec::new).push(tags);
                }
                "readconcernlevel" => {
                    options.read_concern = Some(ReadConcern::custom(value.to_string()));
                }
                "replicaset" => {
                    options.repl_set_name = Some(value.to_string());
                }
                "retryreads" => {
                    options.retry_reads = Some(get_bool(key, value)?);
                }
                "retrywrites" => {
                    options.retry_writes = Some(get_bool(key, value)?);
                }
                "serverselectiontimeoutms" => {
                    options.server_selection_timeout = Some(get_duration_ms(key, value)?);
                }
                "serverselectiontryonce" => {
                    options.server_selection_try_once = Some(get_bool(key, value)?);
                }
                "tls" | "ssl" => {
                    tls = Some(get_bool(key, value)?);
                }
                "tlsinsecure" | "tlsallowinvalidcertificates" => {
                    tls_options
                        .get_or_insert_with(Default::default)
                        .allow_invalid_certificates = Some(get_bool(key, value)?);
                }
                "tlscafile" => {
                    tls_options.get_or_insert_with(Default::default).ca_file_path =
                        Some(PathBuf::from(value));
                }
                "tlscertificatekeyfile" => {
                    tls_options
                        .get_or_insert_with(Default::default)
                        .cert_key_file_path = Some(PathBuf::from(value));
                }
                "waitqueuetimeoutms" => {
                    options.wait_queue_timeout = Some(get_duration_ms(key, value)?);
                }
                "w" => {
                    w = Some(match u32::from_str(value) {
                        Ok(n) => Acknowledgment::Nodes(n),
                        Err(_) => Acknowledgment::from(value.to_string()),
                    });
                }
                "wtimeoutms" => {
                    w_timeout = Some(get_duration_ms(key, value)?);
                }
                "zlibcompressionlevel" => {
                    let level = i32::from_str(value).map_err(|_| {
                        Error::from(ErrorKind::InvalidArgument {
                            message: "zlibCompressionLevel must be an integer".to_string(),
                        })
                    })?;
                    if !(-1..=9).contains(&level) {
                        return Err(ErrorKind::InvalidArgument {
                            message: "zlibCompressionLevel must be between -1 and 9".to_string(),
                        }
                        .into());
                    }
                    options.zlib_compression_level = Some(level);
                }
                other => {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!("unrecognized connection string option: {}", other),
                    }
                    .into());
                }
            }
        }

        if let Some(names) = compressor_names {
            let mut compressors = Vec::new();
            for name in names {
                compressors.push(Compressor::parse_str(
                    &name,
                    options.zlib_compression_level,
                )?);
            }
            options.compressors = Some(compressors);
        }

        if tls == Some(true) || tls_options.is_some() {
            if tls == Some(false) {
                return Err(ErrorKind::InvalidArgument {
                    message: "TLS options cannot be set with tls=false".to_string(),
                }
                .into());
            }
            options.tls = Some(Tls::Enabled(tls_options.unwrap_or_default()));
        } else if tls == Some(false) {
            options.tls = Some(Tls::Disabled);
        }

        if w.is_some() || w_timeout.is_some() || journal.is_some() {
            options.write_concern = Some(WriteConcern {
                w,
                w_timeout,
                journal,
            });
        }

        if read_pref_tags.is_some() || max_staleness.is_some() {
            if read_pref_mode.is_none() {
                return Err(ErrorKind::InvalidArgument {
                    message: "readPreferenceTags and maxStalenessSeconds can only be specified \
                              alongside readPreference"
                        .to_string(),
                }
                .into());
            }
        }

        if let Some(mode) = read_pref_mode {
            let read_pref = ReadPreference::from_mode(&mode, read_pref_tags, max_staleness)?;
            options.selection_criteria = Some(read_pref.into());
        }

        if conn_str.username.is_some() || auth_mechanism.is_some() || conn_str.auth_source.is_some()
        {
            let mut credential = Credential {
                username: conn_str.username.take(),
                password: conn_str.password.take(),
                source: conn_str.auth_source.take(),
                mechanism: auth_mechanism,
                mechanism_properties: auth_mechanism_properties,
            };
            if credential.source.is_none() {
                credential.source = match credential.mechanism {
                    Some(ref mechanism) => mechanism.default_source().map(String::from),
                    None => options.default_database.clone(),
                };
            }
            options.credential = Some(credential);
        } else if auth_mechanism_properties.is_some() {
            return Err(ErrorKind::InvalidArgument {
                message: "authMechanismProperties can only be specified alongside an \
                          authentication mechanism"
                    .to_string(),
            }
            .into());
        }

        Ok(options)
    }
}

/// Contains the options that can be used to create a new
/// [`ClientSession`](crate::ClientSession).
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct SessionOptions {
    /// The default options to use for transactions started on this session.
    ///
    /// If these options are not specified, they will be inherited from the client associated
    /// with this session.
    pub default_transaction_options: Option<TransactionOptions>,

    /// If true, all operations performed in the context of this session will be [causally
    /// consistent](https://www.mongodb.com/docs/manual/core/causal-consistency-read-write-concerns/).
    ///
    /// Defaults to true.
    pub causal_consistency: Option<bool>,
}

impl SessionOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Contains the options that can be used for a transaction.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct TransactionOptions {
    /// The read concern to use for the transaction.
    #[serde(skip_serializing)]
    pub read_concern: Option<ReadConcern>,

    /// The write concern to use when committing or aborting a transaction.
    #[serde(skip_serializing)]
    pub write_concern: Option<WriteConcern>,

    /// The selection criteria to use for all read operations in a transaction.
    #[serde(skip)]
    pub selection_criteria: Option<SelectionCriteria>,

    /// The maximum amount of time to allow a single commitTransaction to run.
    #[serde(
        serialize_with = "crate::serde_util::serialize_duration_option_as_int_millis",
        deserialize_with = "crate::serde_util::deserialize_duration_option_from_u64_millis",
        rename = "maxTimeMS",
        default
    )]
    pub max_commit_time: Option<Duration>,
}

/// Metadata identifying the driver in the connection handshake.
#[skip_serializing_none]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DriverInfo {
    /// The name of the library wrapping the driver.
    #[builder(!default)]
    pub name: String,

    /// The version of the library wrapping the driver.
    pub version: Option<String>,

    /// Optional platform information for the wrapping driver.
    pub platform: Option<String>,
}

impl Display for DriverInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(version) = &self.version {
            f.write_char('|')?;
            f.write_str(version)?;
        }
        if let Some(platform) = &self.platform {
            f.write_char('|')?;
            f.write_str(platform)?;
        }
        Ok(())
    }
}
