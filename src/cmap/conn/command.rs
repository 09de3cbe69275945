use serde::de::DeserializeOwned;

use super::wire::Message;
use crate::{
    bson::{Bson, Document},
    bson_util,
    client::{ClusterTime, HELLO_COMMAND_NAMES, REDACTED_COMMANDS},
    concern::ReadConcernInternal,
    error::{Error, ErrorKind, Result},
    operation::CommandErrorBody,
    options::ServerAddress,
    selection_criteria::ReadPreference,
};

/// Driver-side model of a database command, containing everything needed to serialize it to a
/// wire message.
#[derive(Debug, Clone)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
    pub(crate) exhaust_allowed: bool,
}

impl Command {
    /// Constructs a new command.
    pub(crate) fn new(name: impl ToString, target_db: impl ToString, body: Document) -> Self {
        Self {
            name: name.to_string(),
            target_db: target_db.to_string(),
            body,
            exhaust_allowed: false,
        }
    }

    /// Constructs a read command with an attached read concern.
    pub(crate) fn new_read(
        name: impl ToString,
        target_db: impl ToString,
        read_concern: Option<ReadConcernInternal>,
        mut body: Document,
    ) -> Result<Self> {
        if let Some(read_concern) = read_concern {
            body.insert("readConcern", crate::bson::to_document(&read_concern)?);
        }
        Ok(Self {
            name: name.to_string(),
            target_db: target_db.to_string(),
            body,
            exhaust_allowed: false,
        })
    }

    pub(crate) fn set_session(&mut self, lsid: &Document) {
        self.body.insert("lsid", lsid.clone());
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        // this serialization should never fail.
        if let Ok(doc) = crate::bson::to_document(cluster_time) {
            self.body.insert("$clusterTime", doc);
        }
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.body.insert("txnNumber", txn_number);
    }

    pub(crate) fn set_read_preference(&mut self, read_preference: ReadPreference) {
        self.body
            .insert("$readPreference", read_preference.into_document());
    }

    pub(crate) fn set_start_transaction(&mut self) {
        self.body.insert("startTransaction", true);
    }

    pub(crate) fn set_autocommit(&mut self) {
        self.body.insert("autocommit", false);
    }

    /// Sets `readConcern.afterClusterTime` for causally consistent reads, preserving any level
    /// already present on the command.
    pub(crate) fn set_after_cluster_time(&mut self, operation_time: crate::bson::Timestamp) {
        let mut read_concern = self
            .body
            .get_document("readConcern")
            .map(Clone::clone)
            .unwrap_or_default();
        read_concern.insert("afterClusterTime", Bson::Timestamp(operation_time));
        self.body.insert("readConcern", read_concern);
    }

    pub(crate) fn set_read_concern_level(&mut self, level: crate::concern::ReadConcernLevel) {
        let mut read_concern = self
            .body
            .get_document("readConcern")
            .map(Clone::clone)
            .unwrap_or_default();
        read_concern.insert("level", level.as_str());
        self.body.insert("readConcern", read_concern);
    }

    pub(crate) fn set_recovery_token(&mut self, recovery_token: &Document) {
        self.body.insert("recoveryToken", recovery_token.clone());
    }

    /// Whether the contents of this command should be scrubbed from command monitoring.
    pub(crate) fn should_redact(&self) -> bool {
        let name = self.name.to_lowercase();
        REDACTED_COMMANDS.contains(name.as_str())
            || (HELLO_COMMAND_NAMES.contains(name.as_str())
                && self.body.contains_key("speculativeAuthenticate"))
    }

    /// Whether this command may be compressed on the wire. Handshake and authentication
    /// commands are always sent uncompressed.
    pub(crate) fn should_compress(&self) -> bool {
        let name = self.name.to_lowercase();
        !REDACTED_COMMANDS.contains(name.as_str()) && !HELLO_COMMAND_NAMES.contains(name.as_str())
    }
}

/// A server reply, still backed by the reply document it arrived in.
#[derive(Debug, Clone)]
pub(crate) struct RawCommandResponse {
    source: ServerAddress,
    raw: Document,
}

impl RawCommandResponse {
    pub(crate) fn new(source: ServerAddress, message: Message) -> Result<Self> {
        let raw = message.single_document_response()?;
        Ok(Self { source, raw })
    }

    #[cfg(test)]
    pub(crate) fn with_document_and_address(source: ServerAddress, raw: Document) -> Self {
        Self { source, raw }
    }

    /// Deserialize the body of this response.
    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        crate::bson::from_document(self.raw.clone()).map_err(|e| {
            Error::from(ErrorKind::InvalidResponse {
                message: format!("{}", e),
            })
        })
    }

    /// Deserialize the body of this response, returning an authentication error if it fails.
    pub(crate) fn auth_response_body<T: DeserializeOwned>(
        &self,
        mechanism_name: &str,
    ) -> Result<T> {
        self.body()
            .map_err(|_| Error::invalid_authentication_response(mechanism_name))
    }

    /// Whether this response corresponds to a command success (`ok: 1`).
    pub(crate) fn is_success(&self) -> bool {
        self.raw
            .get("ok")
            .and_then(bson_util::get_int)
            .map(|ok| ok == 1)
            .unwrap_or(false)
    }

    /// Returns an error constructed from this response if it corresponds to a command failure.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }
        let error_response: CommandErrorBody = self.body().map_err(|_| {
            Error::from(ErrorKind::InvalidResponse {
                message: "invalid server response".to_string(),
            })
        })?;
        Err(error_response.into())
    }

    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.raw
            .get_document("$clusterTime")
            .ok()
            .and_then(|doc| crate::bson::from_document(doc.clone()).ok())
    }

    pub(crate) fn operation_time(&self) -> Option<crate::bson::Timestamp> {
        match self.raw.get("operationTime") {
            Some(Bson::Timestamp(ts)) => Some(*ts),
            _ => None,
        }
    }

    pub(crate) fn recovery_token(&self) -> Option<&Document> {
        self.raw.get_document("recoveryToken").ok()
    }

    /// The full reply document.
    pub(crate) fn raw(&self) -> &Document {
        &self.raw
    }

    pub(crate) fn into_raw(self) -> Document {
        self.raw
    }

    /// The address of the server that sent this response.
    #[allow(unused)]
    pub(crate) fn source_address(&self) -> &ServerAddress {
        &self.source
    }
}
