use pretty_assertions::assert_eq;

use super::{CommandErrorBody, CursorBody, Find, FindOptions, GetMore, Insert, Operation};
use crate::{
    bson::{doc, Bson},
    cmap::{RawCommandResponse, StreamDescription},
    concern::{Acknowledgment, WriteConcern},
    cursor::CursorSpecification,
    error::ErrorKind,
    options::ServerAddress,
    Namespace,
};

fn response(doc: crate::bson::Document) -> RawCommandResponse {
    RawCommandResponse::with_document_and_address(
        ServerAddress::parse("localhost:27017").unwrap(),
        doc,
    )
}

#[test]
fn find_builds_expected_command() {
    let ns = Namespace::new("db", "coll");
    let options = FindOptions::builder()
        .limit(-5_i64)
        .batch_size(10_u32)
        .sort(doc! { "x": 1 })
        .build();
    let mut op = Find::new(ns, doc! { "x": { "$gt": 1 } }, Some(options));

    let cmd = op.build(&StreamDescription::new_testing()).unwrap();
    assert_eq!(cmd.name, "find");
    assert_eq!(cmd.target_db, "db");
    assert_eq!(cmd.body.get_str("find"), Ok("coll"));
    assert_eq!(cmd.body.get_i64("limit"), Ok(5));
    assert_eq!(cmd.body.get_bool("singleBatch"), Ok(true));
    assert_eq!(cmd.body.get_i32("batchSize"), Ok(10));
    assert!(cmd.body.get_document("filter").is_ok());
}

#[test]
fn find_response_becomes_cursor_specification() {
    let ns = Namespace::new("db", "coll");
    let mut op = Find::new(ns, doc! {}, None);
    let description = StreamDescription::new_testing();
    op.build(&description).unwrap();

    let reply = response(doc! {
        "ok": 1,
        "cursor": {
            "id": 123_i64,
            "ns": "db.coll",
            "firstBatch": [ { "x": 1 }, { "x": 2 } ],
        }
    });

    let spec: CursorSpecification = op.handle_response(reply, &description).unwrap();
    assert_eq!(spec.id, 123);
    assert_eq!(spec.ns, Namespace::new("db", "coll"));
    assert_eq!(spec.buffer.len(), 2);
    assert!(!spec.is_exhausted());
}

#[test]
fn get_more_pins_to_the_cursor_server() {
    let spec = CursorSpecification::new(
        super::CursorInfo {
            id: 42,
            ns: Namespace::new("db", "coll"),
            first_batch: vec![],
            next_batch: vec![],
        },
        ServerAddress::parse("cursor-host:27017").unwrap(),
        Some(5),
        None,
    );

    let mut op = GetMore::new(&spec, None);
    let cmd = op.build(&StreamDescription::new_testing()).unwrap();
    assert_eq!(cmd.body.get_i64("getMore"), Ok(42));
    assert_eq!(cmd.body.get_str("collection"), Ok("coll"));
    assert_eq!(cmd.body.get_i64("batchSize"), Ok(5));

    // The operation carries a predicate pinning selection to the cursor's server.
    let criteria = op.selection_criteria().unwrap();
    match criteria {
        crate::selection_criteria::SelectionCriteria::Predicate(_) => {}
        other => panic!("expected predicate criteria, got {:?}", other),
    }
}

#[test]
fn insert_generates_ids_and_reports_write_errors() {
    let ns = Namespace::new("db", "coll");
    let mut op = Insert::new(
        ns,
        vec![doc! { "x": 1 }, doc! { "_id": "explicit", "x": 2 }],
        None,
        Some(WriteConcern::builder().w(Acknowledgment::Majority).build()),
    );

    let cmd = op.build(&StreamDescription::new_testing()).unwrap();
    assert_eq!(cmd.body.get_str("insert"), Ok("coll"));
    assert_eq!(cmd.body.get_bool("ordered"), Ok(true));
    assert!(cmd.body.get_document("writeConcern").is_ok());
    let docs = cmd.body.get_array("documents").unwrap();
    assert_eq!(docs.len(), 2);

    // Every document in the command carries an `_id`, generated when absent.
    for doc in docs {
        assert!(doc.as_document().unwrap().contains_key("_id"));
    }

    let result = op
        .handle_response(response(doc! { "ok": 1, "n": 2 }), &StreamDescription::new_testing())
        .unwrap();
    assert_eq!(result.inserted_ids.len(), 2);
    assert_eq!(
        result.inserted_ids.get(&1),
        Some(&Bson::String("explicit".to_string()))
    );

    let error = op
        .handle_response(
            response(doc! {
                "ok": 1,
                "n": 1,
                "writeErrors": [ { "index": 1, "code": 11000, "errmsg": "duplicate key" } ]
            }),
            &StreamDescription::new_testing(),
        )
        .unwrap_err();
    assert!(matches!(error.kind.as_ref(), ErrorKind::Write(_)));
}

#[test]
fn command_error_body_carries_labels() {
    let reply = response(doc! {
        "ok": 0,
        "code": 11602,
        "codeName": "InterruptedDueToReplStateChange",
        "errmsg": "interrupted",
        "errorLabels": ["RetryableWriteError"],
    });

    let body: CommandErrorBody = reply.body().unwrap();
    let error: crate::error::Error = body.into();
    assert!(error.contains_label(crate::error::RETRYABLE_WRITE_ERROR));
    assert_eq!(error.sdam_code(), Some(11602));
    assert!(error.is_recovering());
}

#[test]
fn cursor_body_accepts_both_batch_fields() {
    let first: CursorBody = response(doc! {
        "ok": 1,
        "cursor": { "id": 0_i64, "ns": "db.coll", "firstBatch": [ { "x": 1 } ] }
    })
    .body()
    .unwrap();
    assert_eq!(first.cursor.first_batch.len(), 1);

    let next: CursorBody = response(doc! {
        "ok": 1,
        "cursor": { "id": 0_i64, "ns": "db.coll", "nextBatch": [ { "x": 1 }, { "x": 2 } ] }
    })
    .body()
    .unwrap();
    assert_eq!(next.cursor.next_batch.len(), 2);
}
