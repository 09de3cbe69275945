#[cfg(test)]
mod test;

use crate::{
    bson::{doc, Bson, Document},
    client::auth::ClientFirst,
    cmap::{Command, Connection, StreamDescription},
    error::Result,
    hello::{hello_command, run_hello, HelloReply},
    options::{AuthMechanism, ClientOptions, Credential, DriverInfo},
};

#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
use crate::options::Compressor;

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ClientMetadata {
    pub(crate) application: Option<AppMetadata>,
    pub(crate) driver: DriverMetadata,
    pub(crate) os: OsMetadata,
    pub(crate) platform: String,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct AppMetadata {
    pub(crate) name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DriverMetadata {
    pub(crate) name: String,
    pub(crate) version: String,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct OsMetadata {
    pub(crate) os_type: String,
    pub(crate) name: Option<String>,
    pub(crate) architecture: Option<String>,
    pub(crate) version: Option<String>,
}

impl From<&ClientMetadata> for Document {
    fn from(metadata: &ClientMetadata) -> Self {
        let mut metadata_doc = Document::new();

        if let Some(application) = &metadata.application {
            metadata_doc.insert("application", doc! { "name": application.name.as_str() });
        }

        metadata_doc.insert(
            "driver",
            doc! {
                "name": metadata.driver.name.as_str(),
                "version": metadata.driver.version.as_str(),
            },
        );

        metadata_doc.insert("os", Bson::from(&metadata.os));
        metadata_doc.insert("platform", metadata.platform.as_str());

        metadata_doc
    }
}

impl From<&OsMetadata> for Bson {
    fn from(metadata: &OsMetadata) -> Self {
        let mut doc = doc! { "type": metadata.os_type.as_str() };

        if let Some(name) = &metadata.name {
            doc.insert("name", name.as_str());
        }

        if let Some(arch) = &metadata.architecture {
            doc.insert("architecture", arch.as_str());
        }

        if let Some(version) = &metadata.version {
            doc.insert("version", version.as_str());
        }

        Bson::Document(doc)
    }
}

/// Contains the basic handshake information that can be statically determined. This document
/// (potentially with additional fields added) can be cloned and put in the `client` field of
/// the `hello` command.
fn base_client_metadata() -> ClientMetadata {
    ClientMetadata {
        application: None,
        driver: DriverMetadata {
            name: "docdb".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        },
        os: OsMetadata {
            os_type: std::env::consts::OS.into(),
            architecture: Some(std::env::consts::ARCH.into()),
            name: None,
            version: None,
        },
        platform: format!(
            "{} with tokio",
            rustc_version_runtime::version_meta().short_version_string,
        ),
    }
}

type Truncation = fn(&mut ClientMetadata);

const METADATA_TRUNCATIONS: &[Truncation] = &[
    // clear `os.*` except `type`
    |metadata| {
        metadata.os = OsMetadata {
            os_type: metadata.os.os_type.clone(),
            architecture: None,
            name: None,
            version: None,
        }
    },
    // truncate `platform`
    |metadata| {
        metadata.platform = rustc_version_runtime::version_meta().short_version_string;
    },
];

const MAX_HELLO_SIZE: usize = 512;

/// Contains the logic needed to handshake a connection.
#[derive(Clone, Debug)]
pub(crate) struct Handshaker {
    /// The hello command to send when handshaking. This will always be identical given the same
    /// options, so it can be created at the time the Handshaker is created.
    command: Command,

    #[cfg(any(
        feature = "zstd-compression",
        feature = "zlib-compression",
        feature = "snappy-compression"
    ))]
    compressors: Option<Vec<Compressor>>,

    metadata: ClientMetadata,
}

#[derive(Debug, Default)]
pub(crate) struct HandshakerOptions {
    /// The application name specified by the user. This is sent to the server as part of the
    /// handshake that each connection makes when it's created.
    pub(crate) app_name: Option<String>,

    /// The compressors specified by the user. This list is sent to the server and the server
    /// replies with the subset of the compressors it supports.
    #[cfg(any(
        feature = "zstd-compression",
        feature = "zlib-compression",
        feature = "snappy-compression"
    ))]
    pub(crate) compressors: Option<Vec<Compressor>>,

    /// Extra information to append to the driver version in the metadata of the handshake with
    /// the server. This should be used by libraries wrapping the driver, e.g. ODMs.
    pub(crate) driver_info: Option<DriverInfo>,

    /// Whether or not the client is connecting to the deployment through a load balancer.
    pub(crate) load_balanced: bool,
}

impl From<&ClientOptions> for HandshakerOptions {
    fn from(opts: &ClientOptions) -> Self {
        Self {
            app_name: opts.app_name.clone(),
            #[cfg(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            ))]
            compressors: opts.compressors.clone(),
            driver_info: opts.driver_info.clone(),
            load_balanced: opts.load_balanced.unwrap_or(false),
        }
    }
}

impl Handshaker {
    /// Creates a new Handshaker.
    pub(crate) fn new(options: HandshakerOptions) -> Self {
        let mut metadata = base_client_metadata();

        let mut command = hello_command(options.load_balanced.into(), None, None);

        if let Some(app_name) = options.app_name {
            metadata.application = Some(AppMetadata { name: app_name });
        }

        if let Some(driver_info) = options.driver_info {
            metadata.driver.name.push('|');
            metadata.driver.name.push_str(&driver_info.name);

            if let Some(ref version) = driver_info.version {
                metadata.driver.version.push('|');
                metadata.driver.version.push_str(version);
            }

            if let Some(ref driver_info_platform) = driver_info.platform {
                metadata.platform.push('|');
                metadata.platform.push_str(driver_info_platform);
            }
        }

        if options.load_balanced {
            command.body.insert("loadBalanced", true);
        }

        #[cfg(any(
            feature = "zstd-compression",
            feature = "zlib-compression",
            feature = "snappy-compression"
        ))]
        if let Some(ref compressors) = options.compressors {
            command.body.insert(
                "compression",
                Bson::Array(
                    compressors
                        .iter()
                        .map(|compressor| Bson::String(compressor.name().to_string()))
                        .collect(),
                ),
            );
        }

        Self {
            command,
            #[cfg(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            ))]
            compressors: options.compressors,
            metadata,
        }
    }

    fn build_command(&self, credential: Option<&Credential>) -> Result<(Command, Option<ClientFirst>)> {
        let mut command = self.command.clone();

        if let Some(cred) = credential {
            cred.append_needed_mechanism_negotiation(&mut command.body);
        }

        let client_first = set_speculative_auth_info(&mut command.body, credential)?;

        let body_size = doc_len(&command.body)?;
        let mut metadata = self.metadata.clone();
        let mut meta_doc: Document = (&metadata).into();
        const OVERHEAD: usize = 1 /* tag */ + 6 /* name */ + 1 /* null */;
        for trunc_fn in METADATA_TRUNCATIONS {
            if body_size + OVERHEAD + doc_len(&meta_doc)? <= MAX_HELLO_SIZE {
                break;
            }
            trunc_fn(&mut metadata);
            meta_doc = (&metadata).into();
        }
        command.body.insert("client", meta_doc);

        Ok((command, client_first))
    }

    /// Handshakes a connection.
    pub(crate) async fn handshake(
        &self,
        conn: &mut Connection,
        credential: Option<&Credential>,
    ) -> Result<HelloReply> {
        let (command, client_first) = self.build_command(credential)?;
        let mut hello_reply = run_hello(conn, command).await?;

        conn.stream_description = Some(StreamDescription::from_hello_reply(&hello_reply));

        // Record the client's message and the server's response from speculative
        // authentication if the server did send a response.
        let first_round = client_first.and_then(|client_first| {
            hello_reply
                .command_response
                .speculative_authenticate
                .take()
                .map(|server_first| client_first.into_first_round(server_first))
        });

        #[cfg(any(
            feature = "zstd-compression",
            feature = "zlib-compression",
            feature = "snappy-compression"
        ))]
        if let (Some(server_compressors), Some(client_compressors)) = (
            hello_reply.command_response.compressors.as_ref(),
            self.compressors.as_ref(),
        ) {
            // Use the first compressor in the user's list that is also supported by the server.
            if let Some(compressor) = client_compressors.iter().find(|client_compressor| {
                server_compressors
                    .iter()
                    .any(|server_compressor| client_compressor.name() == server_compressor)
            }) {
                conn.compressor = Some(compressor.clone());
            }
        }

        conn.server_id = hello_reply.command_response.connection_id;

        if let Some(credential) = credential {
            credential.authenticate_stream(conn, first_round).await?
        }

        Ok(hello_reply)
    }
}

fn doc_len(doc: &Document) -> Result<usize> {
    let mut buf = Vec::new();
    doc.to_writer(&mut buf)?;
    Ok(buf.len())
}

/// Updates the handshake command document with the speculative authentication info.
fn set_speculative_auth_info(
    command: &mut Document,
    credential: Option<&Credential>,
) -> Result<Option<ClientFirst>> {
    let credential = match credential {
        Some(credential) => credential,
        None => return Ok(None),
    };

    // SCRAM-SHA-256 is assumed for speculative authentication if no mechanism is provided. This
    // doesn't cause issues with servers where it is not the default, since servers that are too
    // old to know it do not support speculative authentication at all.
    let auth_mechanism = credential
        .mechanism
        .as_ref()
        .unwrap_or(&AuthMechanism::ScramSha256);

    let client_first = match auth_mechanism.build_speculative_client_first(credential)? {
        Some(client_first) => client_first,
        None => return Ok(None),
    };

    command.insert("speculativeAuthenticate", client_first.to_document());

    Ok(Some(client_first))
}
