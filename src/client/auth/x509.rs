use crate::{
    bson::{doc, Document},
    client::auth::Credential,
    cmap::{Command, Connection},
    error::{Error, Result},
};

/// Constructs the first client message in the X.509 handshake for speculative authentication.
pub(crate) fn build_speculative_client_first(credential: &Credential) -> Box<Command> {
    Box::new(build_client_first(credential))
}

/// Constructs the first client message in the X.509 handshake.
pub(crate) fn build_client_first(credential: &Credential) -> Command {
    let mut auth_command_doc = doc! {
        "authenticate": 1,
        "mechanism": "MONGODB-X509",
    };

    if let Some(ref username) = credential.username {
        auth_command_doc.insert("user", username);
    }

    Command::new("authenticate", "$external", auth_command_doc)
}

/// Sends the first client message in the X.509 handshake.
pub(crate) async fn send_client_first(
    conn: &mut Connection,
    credential: &Credential,
) -> Result<Document> {
    let command = build_client_first(credential);

    let response = conn.send_command(command, None).await?;
    Ok(response.into_raw())
}

/// Performs X.509 authentication for a given stream, optionally using the response to a
/// speculative authentication attempt performed in the connection handshake.
pub(crate) async fn authenticate_stream(
    conn: &mut Connection,
    credential: &Credential,
    server_first: impl Into<Option<Document>>,
) -> Result<()> {
    let server_response = match server_first.into() {
        Some(server_first) => server_first,
        None => send_client_first(conn, credential).await?,
    };

    if server_response.get_str("dbname") != Ok("$external") {
        return Err(Error::authentication_error(
            "MONGODB-X509",
            "Authentication failed",
        ));
    }

    Ok(())
}
