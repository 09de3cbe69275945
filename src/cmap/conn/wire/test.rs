use tokio::io::AsyncWriteExt;

use super::{Message, MessageFlags, MessageSection};
use crate::bson::doc;

#[tokio::test]
async fn message_round_trip() {
    let body = doc! { "hello": 1, "$db": "admin" };
    let message = Message {
        response_to: 0,
        flags: MessageFlags::empty(),
        sections: vec![
            MessageSection::Document(body.clone()),
            MessageSection::Sequence {
                identifier: "documents".to_string(),
                documents: vec![doc! { "x": 1 }, doc! { "x": 2 }],
            },
        ],
        checksum: None,
        request_id: Some(42),
    };

    let (client, server) = tokio::io::duplex(4096);
    let (mut read_half, _keep_alive) = tokio::io::split(server);
    let (_, mut write_half) = tokio::io::split(client);

    message.write_to(&mut write_half).await.unwrap();
    write_half.flush().await.unwrap();

    let read = Message::read_from(&mut read_half, None).await.unwrap();
    assert_eq!(read.flags, MessageFlags::empty());
    assert_eq!(read.sections.len(), 2);
    match &read.sections[0] {
        MessageSection::Document(doc) => assert_eq!(doc, &body),
        other => panic!("expected document section, got {:?}", other),
    }
    match &read.sections[1] {
        MessageSection::Sequence {
            identifier,
            documents,
        } => {
            assert_eq!(identifier, "documents");
            assert_eq!(documents.len(), 2);
        }
        other => panic!("expected sequence section, got {:?}", other),
    }
}

#[tokio::test]
async fn oversized_reply_is_rejected() {
    let message = Message {
        response_to: 0,
        flags: MessageFlags::empty(),
        sections: vec![MessageSection::Document(doc! { "ok": 1 })],
        checksum: None,
        request_id: Some(1),
    };

    let (client, server) = tokio::io::duplex(4096);
    let (mut read_half, _keep_alive) = tokio::io::split(server);
    let (_, mut write_half) = tokio::io::split(client);

    message.write_to(&mut write_half).await.unwrap();

    // A max message size smaller than the reply means the read is refused up front.
    let result = Message::read_from(&mut read_half, Some(16)).await;
    assert!(result.is_err());
}
