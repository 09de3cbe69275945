use std::str::FromStr;

use crate::{
    cmap::StreamDescription,
    options::{AuthMechanism, Credential},
};

fn mechs() -> [String; 2] {
    [
        AuthMechanism::ScramSha1.as_str().to_string(),
        AuthMechanism::ScramSha256.as_str().to_string(),
    ]
}

#[test]
fn negotiate_both_scram() {
    let description_both = StreamDescription {
        sasl_supported_mechs: Some(mechs().to_vec()),
        ..StreamDescription::new_testing()
    };
    assert_eq!(
        AuthMechanism::from_stream_description(&description_both),
        AuthMechanism::ScramSha256
    );
}

#[test]
fn negotiate_sha1_only() {
    let description_sha1 = StreamDescription {
        sasl_supported_mechs: Some(mechs()[0..=0].to_vec()),
        ..StreamDescription::new_testing()
    };
    assert_eq!(
        AuthMechanism::from_stream_description(&description_sha1),
        AuthMechanism::ScramSha1
    );
}

#[test]
fn negotiate_none() {
    let description_none = StreamDescription::new_testing();
    assert_eq!(
        AuthMechanism::from_stream_description(&description_none),
        AuthMechanism::ScramSha1
    );
}

#[test]
fn mechanism_string_round_trip() {
    for name in ["SCRAM-SHA-1", "SCRAM-SHA-256", "MONGODB-X509", "PLAIN"] {
        assert_eq!(AuthMechanism::from_str(name).unwrap().as_str(), name);
    }
    assert!(AuthMechanism::from_str("MONGODB-CR").is_err());
}

#[test]
fn credential_validation() {
    let no_username = Credential::builder().password("pw".to_string()).build();
    assert!(AuthMechanism::ScramSha256
        .validate_credential(&no_username)
        .is_err());

    let x509_with_password = Credential::builder()
        .username("subject".to_string())
        .password("pw".to_string())
        .build();
    assert!(AuthMechanism::MongoDbX509
        .validate_credential(&x509_with_password)
        .is_err());

    let x509_bad_source = Credential::builder()
        .username("subject".to_string())
        .source("admin".to_string())
        .build();
    assert!(AuthMechanism::MongoDbX509
        .validate_credential(&x509_bad_source)
        .is_err());

    let plain = Credential::builder()
        .username("user".to_string())
        .password("pw".to_string())
        .build();
    assert!(AuthMechanism::Plain.validate_credential(&plain).is_ok());
}

#[test]
fn mechanism_negotiation_key_is_appended() {
    let credential = Credential::builder().username("user".to_string()).build();
    let mut command = crate::bson::doc! { "hello": 1 };
    credential.append_needed_mechanism_negotiation(&mut command);
    assert_eq!(
        command.get_str("saslSupportedMechs").unwrap(),
        "admin.user"
    );

    // A credential with an explicit mechanism does not negotiate.
    let credential = Credential::builder()
        .username("user".to_string())
        .mechanism(AuthMechanism::ScramSha256)
        .build();
    let mut command = crate::bson::doc! { "hello": 1 };
    credential.append_needed_mechanism_negotiation(&mut command);
    assert!(!command.contains_key("saslSupportedMechs"));
}
