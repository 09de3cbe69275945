pub(crate) mod handshake;

use std::time::Duration;

use self::handshake::{Handshaker, HandshakerOptions};
use super::{
    conn::{LoadBalancedGeneration, PendingConnection},
    Connection,
    PoolGeneration,
};
use crate::{
    client::auth::Credential,
    error::{Error, ErrorKind, Result},
    hello::HelloReply,
    options::{ClientOptions, ServerAddress, TlsOptions},
    runtime::{self, stream::DEFAULT_CONNECT_TIMEOUT, AsyncStream, TlsConfig},
    sdam::HandshakePhase,
};

/// Turns an address into a ready-to-use connection: transport, handshake, and authentication,
/// in that order. One establisher is shared by a server's pool and monitor; it owns the cached
/// TLS configuration, which is expensive to build.
#[derive(Clone)]
pub(crate) struct ConnectionEstablisher {
    handshaker: Handshaker,
    tls_config: Option<TlsConfig>,
    connect_timeout: Duration,
}

pub(crate) struct EstablisherOptions {
    handshake_options: HandshakerOptions,
    tls_options: Option<TlsOptions>,
    connect_timeout: Option<Duration>,
}

impl From<&ClientOptions> for EstablisherOptions {
    fn from(options: &ClientOptions) -> Self {
        Self {
            handshake_options: HandshakerOptions::from(options),
            tls_options: options.tls_options(),
            connect_timeout: options.connect_timeout,
        }
    }
}

impl ConnectionEstablisher {
    pub(crate) fn new(options: EstablisherOptions) -> Result<Self> {
        let tls_config = options.tls_options.map(TlsConfig::new).transpose()?;

        let connect_timeout = match options.connect_timeout {
            // Zero is the documented way to ask for no connect timeout at all.
            Some(timeout) if timeout.is_zero() => Duration::MAX,
            Some(timeout) => timeout,
            None => DEFAULT_CONNECT_TIMEOUT,
        };

        Ok(Self {
            handshaker: Handshaker::new(options.handshake_options),
            tls_config,
            connect_timeout,
        })
    }

    /// Opens the transport for one connection: TCP, wrapped in TLS when configured, bounded
    /// by the connect timeout.
    async fn open_transport(&self, address: ServerAddress) -> Result<AsyncStream> {
        runtime::timeout(
            self.connect_timeout,
            AsyncStream::connect(address, self.tls_config.as_ref()),
        )
        .await?
    }

    /// Establishes a pooled connection from its reserved slot. Errors carry the phase the
    /// establishment failed in, which determines how the failure feeds back into the
    /// topology.
    pub(crate) async fn establish_connection(
        &self,
        slot: PendingConnection,
        credential: Option<&Credential>,
    ) -> std::result::Result<Connection, EstablishError> {
        let pool_generation = slot.generation.clone();

        let transport = match self.open_transport(slot.address.clone()).await {
            Ok(transport) => transport,
            Err(cause) => {
                return Err(EstablishError {
                    cause,
                    handshake_phase: HandshakePhase::PreHello {
                        generation: pool_generation,
                    },
                })
            }
        };

        let mut connection = Connection::new_pooled(slot, transport);
        let handshake = self.handshaker.handshake(&mut connection, credential).await;

        self.fix_up_load_balanced_generation(&mut connection, &pool_generation, &handshake)?;

        match handshake {
            Ok(_) => Ok(connection),
            Err(cause) => {
                // With no stream description, the failure happened before the hello reply;
                // the distinction decides whether generation staleness is judged by the pool
                // or the connection.
                let handshake_phase = if connection.stream_description().is_ok() {
                    HandshakePhase::PostHello {
                        generation: connection.generation,
                    }
                } else {
                    HandshakePhase::PreHello {
                        generation: pool_generation,
                    }
                };
                Err(EstablishError {
                    cause,
                    handshake_phase,
                })
            }
        }
    }

    /// In load-balanced mode the backend only becomes known from the handshake's `serviceId`,
    /// so the connection's generation is re-derived from the per-service map afterwards. A
    /// successful handshake with no service id means the "load balancer" isn't one.
    fn fix_up_load_balanced_generation(
        &self,
        connection: &mut Connection,
        pool_generation: &PoolGeneration,
        handshake: &Result<HelloReply>,
    ) -> std::result::Result<(), EstablishError> {
        let PoolGeneration::LoadBalanced(service_generations) = pool_generation else {
            return Ok(());
        };

        match connection.service_id() {
            Some(service_id) => {
                connection.generation = LoadBalancedGeneration {
                    generation: service_generations
                        .get(&service_id)
                        .copied()
                        .unwrap_or(0),
                    service_id,
                }
                .into();
                Ok(())
            }
            None if handshake.is_ok() => Err(EstablishError {
                cause: ErrorKind::IncompatibleServer {
                    message: "the driver is in load balancing mode, but the server does not \
                              support it"
                        .to_string(),
                }
                .into(),
                handshake_phase: HandshakePhase::PostHello {
                    generation: connection.generation,
                },
            }),
            // The handshake failed before a service id arrived; its own error is the one
            // worth reporting.
            None => Ok(()),
        }
    }

    /// Establishes a monitoring connection, returning the handshake reply alongside it so
    /// the monitor can publish the initial server description.
    pub(crate) async fn establish_monitoring_connection(
        &self,
        address: ServerAddress,
        id: u32,
    ) -> Result<(Connection, HelloReply)> {
        let transport = self.open_transport(address.clone()).await?;
        let mut connection = Connection::new_monitoring(address, transport, id);

        let reply = self.handshaker.handshake(&mut connection, None).await?;

        Ok((connection, reply))
    }
}

/// An establishment failure, tagged with the phase it occurred in.
#[derive(Debug, Clone)]
pub(crate) struct EstablishError {
    pub(crate) cause: Error,
    pub(crate) handshake_phase: HandshakePhase,
}
