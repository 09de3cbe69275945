mod description;
mod monitor;
pub(crate) mod public;
mod server;
#[cfg(test)]
mod test;
pub(crate) mod topology;

pub use self::public::{ServerInfo, ServerType, TopologyType};

pub(crate) use self::{
    description::{
        server::{ServerDescription, TopologyVersion},
        topology::{
            server_selection::{try_select_server, SelectedServer},
            verify_max_staleness,
            TopologyDescription,
            TransactionSupportStatus,
        },
    },
    monitor::{DEFAULT_HEARTBEAT_FREQUENCY, MIN_HEARTBEAT_FREQUENCY},
    server::Server,
    topology::{HandshakePhase, Topology, TopologyUpdater, TopologyWatcher},
};
