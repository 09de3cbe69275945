use std::{
    borrow::Cow,
    collections::HashMap,
    fmt::{self, Display, Formatter},
    ops::{BitXor, Range},
    str,
    sync::RwLock,
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{
    digest::{FixedOutput, KeyInit, MacMarker, Update},
    Hmac,
    Mac,
};
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::Sha256;
use std::sync::LazyLock;

use crate::{
    bson::{Bson, Document},
    client::auth::{
        self,
        sasl::{SaslContinue, SaslResponse, SaslStart},
        AuthMechanism,
        Credential,
    },
    cmap::{Command, Connection},
    error::{Error, Result},
};

// The single letter attribute keys in SCRAM messages.
const ITERATION_COUNT_KEY: char = 'i';
const ERROR_KEY: char = 'e';
const PROOF_KEY: char = 'p';
const VERIFIER_KEY: char = 'v';
const NONCE_KEY: char = 'r';
const SALT_KEY: char = 's';
const CHANNEL_BINDING_KEY: char = 'c';
const USERNAME_KEY: char = 'n';

/// Constant specifying that we won't be using channel binding.
const NO_CHANNEL_BINDING: char = 'n';

/// The minimum number of iterations of the hash function that we will accept from the server.
const MIN_ITERATION_COUNT: usize = 4096;

/// Cache of pre-computed salted passwords.
static CREDENTIAL_CACHE: LazyLock<RwLock<HashMap<CacheEntry, Vec<u8>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

#[derive(Hash, Eq, PartialEq)]
struct CacheEntry {
    password: String,
    salt: Vec<u8>,
    i: usize,
    mechanism: ScramVersion,
}

/// The versions of SCRAM supported by the driver (classified according to hash function used).
#[derive(Hash, Eq, PartialEq, Clone, Debug)]
pub(crate) enum ScramVersion {
    Sha1,
    Sha256,
}

impl ScramVersion {
    /// Constructs the first message of the SCRAM handshake, usable for speculative
    /// authentication as part of the connection handshake.
    pub(super) fn build_speculative_client_first(
        &self,
        credential: &Credential,
    ) -> Result<ClientFirst> {
        self.build_client_first(credential, true)
    }

    /// Constructs the first message of the SCRAM handshake.
    fn build_client_first(
        &self,
        credential: &Credential,
        include_db: bool,
    ) -> Result<ClientFirst> {
        let username = credential
            .username
            .as_ref()
            .ok_or_else(|| Error::authentication_error("SCRAM", "no username supplied"))?;

        let nonce = auth::generate_nonce();

        Ok(ClientFirst::new(
            credential.resolved_source(),
            username.as_str(),
            nonce.as_str(),
            include_db,
        ))
    }

    /// Perform SCRAM authentication for a given stream, optionally continuing from the first
    /// round completed speculatively as part of the connection handshake.
    pub(crate) async fn authenticate_stream(
        &self,
        conn: &mut Connection,
        credential: &Credential,
        first_round: Option<FirstRound>,
    ) -> Result<()> {
        let username = credential
            .username
            .as_ref()
            .ok_or_else(|| Error::authentication_error("SCRAM", "no username supplied"))?;

        let password = credential
            .password
            .as_ref()
            .ok_or_else(|| Error::authentication_error("SCRAM", "no password supplied"))?;

        let source = credential.resolved_source().to_string();

        if credential.mechanism_properties.is_some() {
            return Err(Error::authentication_error(
                "SCRAM",
                "mechanism properties MUST NOT be specified",
            ));
        };

        // If the server provided a response to the speculative first round, pick up the
        // exchange from there; otherwise run the first round over the wire now.
        let (client_first, server_first_response) = match first_round {
            Some(FirstRound {
                client_first,
                server_first,
            }) => (client_first, server_first),
            None => {
                let client_first = self.build_client_first(credential, false)?;
                let command = client_first.to_command(self);
                let response = conn.send_command(command, None).await?;
                (client_first, response.into_raw())
            }
        };

        let server_first = ServerFirst::parse(server_first_response)?;
        server_first.validate(client_first.nonce())?;

        let cache_entry_key = CacheEntry {
            password: password.to_string(),
            salt: server_first.salt().to_vec(),
            i: server_first.i(),
            mechanism: self.clone(),
        };
        let (should_update_cache, salted_password) = match CREDENTIAL_CACHE
            .read()
            .map_err(|_| Error::authentication_error("SCRAM", "internal error"))?
            .get(&cache_entry_key)
        {
            Some(pwd) => (false, pwd.clone()),
            None => (
                true,
                self.compute_salted_password(
                    username,
                    password,
                    server_first.i(),
                    server_first.salt(),
                )?,
            ),
        };

        let client_final = ClientFinal::new(
            salted_password.as_slice(),
            &client_first,
            &server_first,
            self,
        )?;

        let command = SaslContinue::new(
            source.clone(),
            client_final.conversation_id.clone(),
            client_final.message().as_bytes().to_vec(),
        )
        .into_command();

        let server_final_response = conn.send_command(command, None).await?;
        let server_final_response =
            SaslResponse::parse("SCRAM", server_final_response.into_raw())?;
        let server_final = ServerFinal::parse(&server_final_response)?;
        server_final.validate(salted_password.as_slice(), &client_final, self)?;

        // With skipEmptyExchange, the server completes on its final message. Older servers
        // require one more client no-op followed by a server no-op with "done: true".
        if !server_final_response.done {
            let noop = SaslContinue::new(
                source,
                server_final.conversation_id().clone(),
                Vec::new(),
            )
            .into_command();
            let server_noop_response = conn.send_command(noop, None).await?;
            let server_noop_response = SaslResponse::parse("SCRAM", server_noop_response.into_raw())?;

            if server_noop_response.conversation_id != *server_final.conversation_id() {
                return Err(Error::authentication_error(
                    "SCRAM",
                    "mismatched conversationId's",
                ));
            };

            if !server_noop_response.done {
                return Err(Error::authentication_error(
                    "SCRAM",
                    "authentication did not complete successfully",
                ));
            }
        }

        if should_update_cache {
            if let Ok(mut cache) = CREDENTIAL_CACHE.write() {
                cache.entry(cache_entry_key).or_insert(salted_password);
            }
        }

        Ok(())
    }

    /// HMAC function used as part of SCRAM authentication.
    fn hmac(&self, key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
        let bytes = match self {
            ScramVersion::Sha1 => auth::mac::<Hmac<Sha1>>(key, input, "SCRAM")?.as_ref().to_vec(),
            ScramVersion::Sha256 => auth::mac::<Hmac<Sha256>>(key, input, "SCRAM")?
                .as_ref()
                .to_vec(),
        };

        Ok(bytes)
    }

    /// Compute the HMAC of the given key and input and verify it matches the given signature.
    fn hmac_verify(&self, key: &[u8], input: &[u8], signature: &[u8]) -> Result<()> {
        match self {
            ScramVersion::Sha1 => mac_verify::<Hmac<Sha1>>(key, input, signature),
            ScramVersion::Sha256 => mac_verify::<Hmac<Sha256>>(key, input, signature),
        }
    }

    /// The "h" function defined in the SCRAM RFC.
    fn h(&self, str: &[u8]) -> Vec<u8> {
        match self {
            ScramVersion::Sha1 => hash::<Sha1>(str),
            ScramVersion::Sha256 => hash::<Sha256>(str),
        }
    }

    /// The "h_i" function as defined in the SCRAM RFC.
    fn h_i(&self, str: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
        match self {
            ScramVersion::Sha1 => h_i::<Hmac<Sha1>>(str, salt, iterations, 160 / 8),
            ScramVersion::Sha256 => h_i::<Hmac<Sha256>>(str, salt, iterations, 256 / 8),
        }
    }

    /// Computes the salted password according to the SCRAM RFC and the server-specific password
    /// hashing algorithm.
    fn compute_salted_password(
        &self,
        username: &str,
        password: &str,
        i: usize,
        salt: &[u8],
    ) -> Result<Vec<u8>> {
        let normalized_password = match self {
            ScramVersion::Sha1 => {
                let mut md5 = Md5::new();
                Digest::update(&mut md5, format!("{}:mongo:{}", username, password));
                Cow::Owned(hex::encode(md5.finalize()))
            }
            ScramVersion::Sha256 => match stringprep::saslprep(password) {
                Ok(p) => p,
                Err(_) => {
                    return Err(Error::authentication_error(
                        "SCRAM-SHA-256",
                        "saslprep failure",
                    ))
                }
            },
        };

        let iterations = u32::try_from(i)
            .map_err(|_| Error::authentication_error("SCRAM", "iteration count invalid"))?;

        Ok(self.h_i(normalized_password.as_ref(), salt, iterations))
    }
}

impl Display for ScramVersion {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ScramVersion::Sha1 => write!(f, "SCRAM-SHA-1"),
            ScramVersion::Sha256 => write!(f, "SCRAM-SHA-256"),
        }
    }
}

fn xor(lhs: &[u8], rhs: &[u8]) -> Vec<u8> {
    debug_assert_eq!(lhs.len(), rhs.len());

    lhs.iter()
        .zip(rhs.iter())
        .map(|(l, r)| l.bitxor(r))
        .collect()
}

fn mac_verify<M: Mac + KeyInit>(key: &[u8], input: &[u8], signature: &[u8]) -> Result<()> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|_| Error::authentication_error("SCRAM", "internal error"))?;
    mac.update(input);
    match mac.verify_slice(signature) {
        Ok(_) => Ok(()),
        Err(_) => Err(Error::authentication_error(
            "SCRAM",
            "Authentication failed.",
        )),
    }
}

fn hash<D: Digest>(val: &[u8]) -> Vec<u8> {
    let mut hash = D::new();
    hash.update(val);
    hash.finalize().to_vec()
}

fn h_i<M: KeyInit + Update + FixedOutput + MacMarker + Clone + Sync>(
    str: &str,
    salt: &[u8],
    iterations: u32,
    output_size: usize,
) -> Vec<u8> {
    let mut buf = vec![0u8; output_size];
    // the output buffer length is fixed and valid, so this cannot fail.
    let _ = pbkdf2::pbkdf2::<M>(str.as_bytes(), salt, iterations, buf.as_mut_slice());
    buf
}

/// Parses a string slice of the form "<expected_key>=<body>" into "<body>", if possible.
fn parse_kvp(str: &str, expected_key: char) -> Result<String> {
    if str.chars().next() != Some(expected_key) || str.chars().nth(1) != Some('=') {
        Err(Error::invalid_authentication_response("SCRAM"))
    } else {
        Ok(str.chars().skip(2).collect())
    }
}

/// Contains the client's first message along with the server's response, for use when the
/// first round was already completed speculatively as part of the connection handshake.
#[derive(Debug)]
pub(crate) struct FirstRound {
    pub(crate) client_first: ClientFirst,

    pub(crate) server_first: Document,
}

/// Model of the first message sent by the client.
#[derive(Debug)]
pub(crate) struct ClientFirst {
    source: String,

    message: String,

    gs2_header: Range<usize>,

    bare: Range<usize>,

    nonce: String,

    include_db: bool,
}

impl ClientFirst {
    fn new(source: &str, username: &str, nonce: &str, include_db: bool) -> Self {
        let gs2_header = format!("{},,", NO_CHANNEL_BINDING);
        let bare = format!("{}={},{}={}", USERNAME_KEY, username, NONCE_KEY, nonce);
        let full = format!("{}{}", &gs2_header, &bare);
        let end = full.len();
        ClientFirst {
            source: source.to_string(),
            message: full,
            gs2_header: Range {
                start: 0,
                end: gs2_header.len(),
            },
            bare: Range {
                start: gs2_header.len(),
                end,
            },
            nonce: nonce.to_string(),
            include_db,
        }
    }

    fn bare_message(&self) -> &str {
        &self.message[self.bare.clone()]
    }

    fn gs2_header(&self) -> &str {
        &self.message[self.gs2_header.clone()]
    }

    fn message(&self) -> &str {
        &self.message[..]
    }

    fn nonce(&self) -> &str {
        self.nonce.as_str()
    }

    pub(crate) fn to_command(&self, scram: &ScramVersion) -> Command {
        let payload = self.message().as_bytes().to_vec();
        let auth_mech = match scram {
            ScramVersion::Sha1 => AuthMechanism::ScramSha1,
            ScramVersion::Sha256 => AuthMechanism::ScramSha256,
        };
        let mut command = SaslStart::new(self.source.clone(), auth_mech, payload).into_command();

        if self.include_db {
            command.body.insert("db", self.source.clone());
        }

        command
    }
}

/// Model of the first message received from the server.
///
/// This MUST be validated before sending the `ClientFinal` message back to the server.
struct ServerFirst {
    conversation_id: Bson,
    done: bool,
    message: String,
    nonce: String,
    salt: Vec<u8>,
    i: usize,
}

impl ServerFirst {
    fn parse(response: Document) -> Result<Self> {
        let SaslResponse {
            conversation_id,
            done,
            payload,
        } = SaslResponse::parse("SCRAM", response)?;

        let message = str::from_utf8(&payload)
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

        let parts: Vec<&str> = message.split(',').collect();

        if parts.len() < 3 {
            return Err(Error::invalid_authentication_response("SCRAM"));
        };

        let full_nonce = parse_kvp(parts[0], NONCE_KEY)?;

        let salt = BASE64
            .decode(parse_kvp(parts[1], SALT_KEY)?.as_str())
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

        let i: usize = match parse_kvp(parts[2], ITERATION_COUNT_KEY)?.parse() {
            Ok(num) => num,
            Err(_) => {
                return Err(Error::authentication_error(
                    "SCRAM",
                    "iteration count invalid",
                ))
            }
        };

        Ok(ServerFirst {
            conversation_id,
            done,
            message: message.to_string(),
            nonce: full_nonce,
            salt,
            i,
        })
    }

    fn conversation_id(&self) -> &Bson {
        &self.conversation_id
    }

    fn message(&self) -> &str {
        self.message.as_str()
    }

    fn nonce(&self) -> &str {
        self.nonce.as_str()
    }

    fn salt(&self) -> &[u8] {
        self.salt.as_slice()
    }

    fn i(&self) -> usize {
        self.i
    }

    fn validate(&self, nonce: &str) -> Result<()> {
        if self.done {
            Err(Error::authentication_error(
                "SCRAM",
                "handshake terminated early",
            ))
        } else if !self.nonce.starts_with(nonce) {
            Err(Error::authentication_error("SCRAM", "mismatched nonce"))
        } else if self.i < MIN_ITERATION_COUNT {
            Err(Error::authentication_error(
                "SCRAM",
                "iteration count too low",
            ))
        } else {
            Ok(())
        }
    }
}

/// Model of the final message sent by the client.
///
/// Contains the "AuthMessage" mentioned in the RFC used in computing the client and server
/// signatures.
struct ClientFinal {
    message: String,
    auth_message: String,
    conversation_id: Bson,
}

impl ClientFinal {
    fn new(
        salted_password: &[u8],
        client_first: &ClientFirst,
        server_first: &ServerFirst,
        scram: &ScramVersion,
    ) -> Result<Self> {
        let client_key = scram.hmac(salted_password, b"Client Key")?;
        let stored_key = scram.h(client_key.as_slice());

        let without_proof = format!(
            "{}={},{}={}",
            CHANNEL_BINDING_KEY,
            BASE64.encode(client_first.gs2_header()),
            NONCE_KEY,
            server_first.nonce()
        );
        let auth_message = format!(
            "{},{},{}",
            client_first.bare_message(),
            server_first.message(),
            without_proof.as_str()
        );
        let client_signature = scram.hmac(stored_key.as_slice(), auth_message.as_bytes())?;
        let client_proof =
            BASE64.encode(xor(client_key.as_slice(), client_signature.as_slice()).as_slice());

        let message = format!("{},{}={}", without_proof, PROOF_KEY, client_proof);

        Ok(ClientFinal {
            message,
            auth_message,
            conversation_id: server_first.conversation_id().clone(),
        })
    }

    fn message(&self) -> &str {
        self.message.as_str()
    }

    fn auth_message(&self) -> &str {
        self.auth_message.as_str()
    }
}

enum ServerFinalBody {
    Error(String),
    Verifier(String),
}

/// Model of the final message received from the server.
struct ServerFinal {
    conversation_id: Bson,
    body: ServerFinalBody,
}

impl ServerFinal {
    fn parse(response: &SaslResponse) -> Result<Self> {
        let message = str::from_utf8(&response.payload)
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

        let first = message
            .chars()
            .next()
            .ok_or_else(|| Error::invalid_authentication_response("SCRAM"))?;
        let body = if first == ERROR_KEY {
            let error = parse_kvp(message, ERROR_KEY)?;
            ServerFinalBody::Error(error)
        } else if first == VERIFIER_KEY {
            let verifier = parse_kvp(message, VERIFIER_KEY)?;
            ServerFinalBody::Verifier(verifier)
        } else {
            return Err(Error::invalid_authentication_response("SCRAM"));
        };

        Ok(ServerFinal {
            conversation_id: response.conversation_id.clone(),
            body,
        })
    }

    fn validate(
        &self,
        salted_password: &[u8],
        client_final: &ClientFinal,
        scram: &ScramVersion,
    ) -> Result<()> {
        if self.conversation_id != client_final.conversation_id {
            return Err(Error::authentication_error(
                "SCRAM",
                "mismatched conversationId's",
            ));
        };

        match self.body {
            ServerFinalBody::Verifier(ref body) => {
                let server_key = scram.hmac(salted_password, b"Server Key")?;
                let body_decoded = BASE64
                    .decode(body.as_bytes())
                    .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

                scram.hmac_verify(
                    server_key.as_slice(),
                    client_final.auth_message().as_bytes(),
                    body_decoded.as_slice(),
                )
            }
            ServerFinalBody::Error(ref err) => {
                Err(Error::authentication_error("SCRAM", err.as_str()))
            }
        }
    }

    fn conversation_id(&self) -> &Bson {
        &self.conversation_id
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn iteration_count_is_validated() {
        let nonce = "mocked";

        let invalid_iteration_count = ServerFirst {
            conversation_id: Bson::Null,
            done: false,
            message: "mocked".to_string(),
            nonce: nonce.to_string(),
            salt: Vec::new(),
            i: 42,
        };
        assert!(invalid_iteration_count.validate(nonce).is_err());

        let valid_iteration_count = ServerFirst {
            i: 4096,
            ..invalid_iteration_count
        };
        assert!(valid_iteration_count.validate(nonce).is_ok())
    }

    #[test]
    fn hmac_round_trip() {
        let key = ScramVersion::Sha256.hmac(b"secret", b"payload").unwrap();
        assert_eq!(key.len(), 32);
        ScramVersion::Sha256
            .hmac_verify(b"secret", b"payload", &key)
            .unwrap();
        assert!(ScramVersion::Sha256
            .hmac_verify(b"secret", b"payload", b"bogus")
            .is_err());
    }

    #[test]
    fn client_first_shape() {
        let client_first = ClientFirst::new("admin", "user", "nonce", false);
        assert_eq!(client_first.message(), "n,,n=user,r=nonce");
        assert_eq!(client_first.gs2_header(), "n,,");
        assert_eq!(client_first.bare_message(), "n=user,r=nonce");

        let command = client_first.to_command(&ScramVersion::Sha256);
        assert_eq!(command.name, "saslStart");
        assert_eq!(command.body.get_i32("saslStart"), Ok(1));
        assert_eq!(command.body.get_str("mechanism"), Ok("SCRAM-SHA-256"));
        assert!(!command.body.contains_key("db"));

        let speculative = ClientFirst::new("admin", "user", "nonce", true);
        let command = speculative.to_command(&ScramVersion::Sha256);
        assert_eq!(command.body.get_str("db"), Ok("admin"));
    }
}
