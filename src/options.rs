//! Contains all of the types needed to specify the options for driver operations.

pub use crate::{
    client::{
        auth::{AuthMechanism, Credential},
        options::*,
    },
    cmap::options::ConnectionPoolOptions,
    compression::Compressor,
    concern::*,
    operation::FindOptions,
    selection_criteria::*,
};
