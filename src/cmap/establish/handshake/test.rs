use super::{Handshaker, HandshakerOptions};
use crate::options::Credential;

#[test]
fn metadata_is_attached_and_truncated() {
    let options = HandshakerOptions {
        app_name: Some("test-app".to_string()),
        ..Default::default()
    };

    let handshaker = Handshaker::new(options);
    let (command, client_first) = handshaker.build_command(None).unwrap();

    assert!(client_first.is_none());
    let client = command.body.get_document("client").unwrap();
    assert_eq!(
        client.get_document("application").unwrap().get_str("name"),
        Ok("test-app")
    );
    assert_eq!(
        client.get_document("driver").unwrap().get_str("name"),
        Ok("docdb")
    );
    assert!(client.get_document("os").unwrap().get_str("type").is_ok());

    let mut serialized = Vec::new();
    command.body.to_writer(&mut serialized).unwrap();
    assert!(serialized.len() <= 1024);
}

#[test]
fn speculative_auth_defaults_to_scram_sha_256() {
    let handshaker = Handshaker::new(HandshakerOptions::default());
    let credential = Credential::builder()
        .username("user".to_string())
        .password("pw".to_string())
        .build();

    let (command, client_first) = handshaker.build_command(Some(&credential)).unwrap();
    assert!(client_first.is_some());

    let speculative = command.body.get_document("speculativeAuthenticate").unwrap();
    assert_eq!(speculative.get_str("mechanism"), Ok("SCRAM-SHA-256"));
    assert_eq!(speculative.get_str("db"), Ok("admin"));
}

#[test]
fn mechanism_negotiation_requested_when_unset() {
    let handshaker = Handshaker::new(HandshakerOptions::default());
    let credential = Credential::builder()
        .username("user".to_string())
        .password("pw".to_string())
        .build();

    let (command, _) = handshaker.build_command(Some(&credential)).unwrap();
    assert_eq!(
        command.body.get_str("saslSupportedMechs"),
        Ok("admin.user")
    );
}
