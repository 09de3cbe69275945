use std::time::{Duration, Instant};

use super::{
    description::server::ServerDescription,
    topology::{TopologyCheckRequestReceiver, TopologyUpdater, TopologyWatcher},
};
use crate::{
    cmap::{establish::ConnectionEstablisher, Connection},
    error::{Error, Result},
    event::{
        sdam::{
            SdamEvent,
            ServerHeartbeatFailedEvent,
            ServerHeartbeatStartedEvent,
            ServerHeartbeatSucceededEvent,
        },
        EventEmitter,
    },
    hello::{hello_command, run_hello, AwaitableHelloOptions, HelloReply},
    options::{ClientOptions, ServerAddress},
    runtime,
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

/// The minimum amount of time a monitor must wait between checks of the same server, bounding
/// how often an immediate check request can be honored.
pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// The weight applied to the newest round trip time measurement when folding it into the
/// moving average.
const RTT_SMOOTHING_FACTOR: f64 = 0.2;

/// Monitor that performs regular heartbeats to determine server status.
pub(crate) struct Monitor {
    address: ServerAddress,

    /// The dedicated monitoring connection. Never shared with application traffic.
    connection: Option<Connection>,

    /// The id assigned to the next monitoring connection created by this monitor.
    next_connection_id: u32,

    establisher: ConnectionEstablisher,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    event_emitter: EventEmitter,
    check_request_receiver: TopologyCheckRequestReceiver,
    options: ClientOptions,

    /// The exponentially-weighted moving average of heartbeat round trip times, seeded by the
    /// first measurement.
    average_round_trip_time: Option<Duration>,

    /// The topology version from the most recent reply, used to issue awaited hellos.
    topology_version: Option<crate::sdam::TopologyVersion>,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        address: ServerAddress,
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        event_emitter: EventEmitter,
        check_request_receiver: TopologyCheckRequestReceiver,
        establisher: ConnectionEstablisher,
        options: ClientOptions,
    ) {
        let monitor = Self {
            address,
            connection: None,
            next_connection_id: 1,
            establisher,
            topology_updater,
            topology_watcher,
            event_emitter,
            check_request_receiver,
            options,
            average_round_trip_time: None,
            topology_version: None,
        };
        runtime::spawn(monitor.execute());
    }

    fn is_alive(&self) -> bool {
        self.topology_watcher.is_alive() && self.topology_watcher.server_exists(&self.address)
    }

    async fn execute(mut self) {
        let heartbeat_frequency = self
            .options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY);

        while self.is_alive() {
            self.check_server().await;

            // A server that reports a topology version supports awaited hellos: the server
            // holds the reply until its state changes or the timer elapses, so the monitor can
            // loop immediately instead of sleeping.
            if self.topology_version.is_some() && self.is_alive() {
                self.execute_streaming(heartbeat_frequency).await;
                continue;
            }

            #[cfg(test)]
            let min_frequency = self
                .options
                .test_options
                .as_ref()
                .and_then(|to| to.min_heartbeat_freq)
                .unwrap_or(MIN_HEARTBEAT_FREQUENCY);

            #[cfg(not(test))]
            let min_frequency = MIN_HEARTBEAT_FREQUENCY;

            // The minimum frequency is an unconditional sleep; only the remainder of the
            // heartbeat interval can be skipped by an immediate check request.
            runtime::delay_for(min_frequency).await;
            self.check_request_receiver
                .wait_for_check_request(heartbeat_frequency.saturating_sub(min_frequency))
                .await;
        }
    }

    /// Repeatedly issue awaited hellos until an error occurs or the monitor is no longer
    /// needed. Failures transition back to the polling path.
    async fn execute_streaming(&mut self, heartbeat_frequency: Duration) {
        while self.is_alive() {
            let topology_version = match self.topology_version {
                Some(tv) => tv,
                None => return,
            };

            let options = AwaitableHelloOptions {
                topology_version,
                max_await_time: heartbeat_frequency,
            };

            let result = self.perform_awaited_hello(options).await;

            match result {
                Ok(reply) => {
                    self.topology_version = reply.command_response.topology_version;

                    let server_description = ServerDescription::from_reply(
                        self.address.clone(),
                        reply,
                        self.average_round_trip_time
                            .unwrap_or(Duration::from_millis(0)),
                    );
                    self.topology_updater.update(server_description).await;
                }
                Err(error) => {
                    self.connection.take();
                    self.topology_version = None;
                    self.topology_updater
                        .handle_monitor_error(self.address.clone(), error)
                        .await;
                    return;
                }
            }
        }
    }

    /// Checks the server by running a hello command. If an I/O error occurs, the connection is
    /// replaced with a new one.
    async fn check_server(&mut self) -> bool {
        self.check_request_receiver.clear_check_requests();
        let mut retried = false;
        let check_result = match self.perform_hello().await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                let previous_description =
                    self.topology_watcher.server_description(&self.address);
                if e.is_network_error()
                    && previous_description
                        .map(|sd| sd.is_available())
                        .unwrap_or(false)
                {
                    // A single network error against a previously available server could be a
                    // transient hiccup; publish the failure and immediately check once more.
                    self.handle_error(e).await;
                    retried = true;
                    self.perform_hello().await
                } else {
                    Err(e)
                }
            }
        };

        match check_result {
            Ok(reply) => {
                self.topology_version = reply.command_response.topology_version;
                let server_description = ServerDescription::from_reply(
                    self.address.clone(),
                    reply,
                    self.average_round_trip_time
                        .unwrap_or(Duration::from_millis(0)),
                );
                self.topology_updater.update(server_description).await
            }
            Err(e) => self.handle_error(e).await || retried,
        }
    }

    async fn perform_hello(&mut self) -> Result<HelloReply> {
        self.emit_started_event(false);

        let start = Instant::now();
        let result = match self.connection {
            Some(ref mut conn) => {
                let command = hello_command(
                    self.options.load_balanced,
                    Some(conn.stream_description()?.hello_ok),
                    None,
                );
                run_hello(conn, command).await
            }
            None => {
                let connection_id = self.next_connection_id;
                self.next_connection_id += 1;
                let res = self
                    .establisher
                    .establish_monitoring_connection(self.address.clone(), connection_id)
                    .await;
                match res {
                    Ok((connection, reply)) => {
                        self.connection = Some(connection);
                        Ok(reply)
                    }
                    Err(e) => Err(e),
                }
            }
        };
        let duration = start.elapsed();

        match result {
            Ok(ref reply) => {
                self.update_average_round_trip_time(duration);
                self.emit_succeeded_event(duration, reply, false);
            }
            Err(ref e) => {
                self.connection.take();
                self.topology_version = None;
                self.emit_failed_event(duration, e, false);
            }
        }

        result
    }

    async fn perform_awaited_hello(&mut self, options: AwaitableHelloOptions) -> Result<HelloReply> {
        self.emit_started_event(true);

        let start = Instant::now();
        let result = match self.connection {
            Some(ref mut conn) => {
                // The reply is held by the server for up to maxAwaitTimeMS; the read deadline
                // leaves room on top of that for the reply to travel.
                let timeout = options.max_await_time + options.max_await_time / 2;
                if conn.is_streaming() {
                    runtime::timeout(timeout, conn.receive_message())
                        .await
                        .and_then(std::convert::identity)
                        .and_then(|raw| {
                            raw.validate()?;
                            hello_reply_from_raw(self.address.clone(), raw)
                        })
                } else {
                    let command = hello_command(
                        self.options.load_balanced,
                        Some(conn.stream_description()?.hello_ok),
                        Some(options),
                    );
                    runtime::timeout(timeout, run_hello(conn, command))
                        .await
                        .and_then(std::convert::identity)
                }
            }
            None => Err(Error::internal("no monitoring connection for awaited check")),
        };
        let duration = start.elapsed();

        match result {
            Ok(ref reply) => {
                self.emit_succeeded_event(duration, reply, true);
            }
            Err(ref e) => {
                self.emit_failed_event(duration, e, true);
            }
        }

        result
    }

    /// Fold a new measurement into the round trip time moving average, seeding the average with
    /// the first measurement.
    fn update_average_round_trip_time(&mut self, sample: Duration) {
        self.average_round_trip_time = Some(match self.average_round_trip_time {
            Some(old_rtt) => Duration::from_secs_f64(
                RTT_SMOOTHING_FACTOR * sample.as_secs_f64()
                    + (1.0 - RTT_SMOOTHING_FACTOR) * old_rtt.as_secs_f64(),
            ),
            None => sample,
        });
    }

    async fn handle_error(&mut self, error: Error) -> bool {
        self.topology_updater
            .handle_monitor_error(self.address.clone(), error)
            .await
    }

    fn emit_started_event(&self, awaited: bool) {
        self.event_emitter
            .emit(SdamEvent::ServerHeartbeatStarted(
                ServerHeartbeatStartedEvent {
                    server_address: self.address.clone(),
                    awaited,
                    driver_connection_id: self.connection.as_ref().map(|c| c.id).unwrap_or(0),
                },
            ));
    }

    fn emit_succeeded_event(&self, duration: Duration, reply: &HelloReply, awaited: bool) {
        let mut reply_doc = reply.raw_command_response.clone();
        // if this hello call is part of a handshake, remove speculative authentication
        // information before publishing an event
        reply_doc.remove("speculativeAuthenticate");
        self.event_emitter
            .emit(SdamEvent::ServerHeartbeatSucceeded(
                ServerHeartbeatSucceededEvent {
                    duration,
                    reply: reply_doc,
                    server_address: self.address.clone(),
                    awaited,
                    driver_connection_id: self.connection.as_ref().map(|c| c.id).unwrap_or(0),
                },
            ));
    }

    fn emit_failed_event(&self, duration: Duration, error: &Error, awaited: bool) {
        self.event_emitter
            .emit(SdamEvent::ServerHeartbeatFailed(ServerHeartbeatFailedEvent {
                duration,
                failure: error.clone(),
                server_address: self.address.clone(),
                awaited,
                driver_connection_id: self.connection.as_ref().map(|c| c.id).unwrap_or(0),
            }));
    }
}

/// Assemble a `HelloReply` from a raw streaming reply.
fn hello_reply_from_raw(
    server_address: ServerAddress,
    raw: crate::cmap::RawCommandResponse,
) -> Result<HelloReply> {
    let cluster_time = raw.cluster_time();
    let raw_command_response = raw.into_raw();
    let command_response = crate::bson::from_document(raw_command_response.clone())?;
    Ok(HelloReply {
        server_address,
        command_response,
        raw_command_response,
        cluster_time,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[tokio::test]
    async fn rtt_average_is_seeded_and_smoothed() {
        let (updater, _updater_rx) = TopologyUpdater::channel();
        let options = ClientOptions::default();
        let establisher = crate::cmap::establish::ConnectionEstablisher::new(
            crate::cmap::establish::EstablisherOptions::from(&options),
        )
        .unwrap();
        let (_sender, receiver) = tokio::sync::watch::channel(
            crate::sdam::topology::TopologyState {
                description: Default::default(),
                servers: Default::default(),
            },
        );
        let requester = {
            let (sender, _) = tokio::sync::broadcast::channel(1);
            crate::sdam::topology::TopologyCheckRequestReceiver::new_test(sender.subscribe())
        };

        let mut monitor = Monitor {
            address: crate::options::ServerAddress::Tcp {
                host: "localhost".to_string(),
                port: None,
            },
            connection: None,
            next_connection_id: 1,
            establisher,
            topology_updater: updater,
            topology_watcher: crate::sdam::topology::TopologyWatcher::new_test(receiver),
            event_emitter: crate::event::start_dispatcher(Default::default()),
            check_request_receiver: requester,
            options,
            average_round_trip_time: None,
            topology_version: None,
        };

        monitor.update_average_round_trip_time(Duration::from_millis(100));
        assert_eq!(
            monitor.average_round_trip_time,
            Some(Duration::from_millis(100))
        );

        monitor.update_average_round_trip_time(Duration::from_millis(200));
        assert_relative_eq!(
            monitor.average_round_trip_time.unwrap().as_secs_f64(),
            0.12,
            epsilon = 0.0001
        );
    }
}
