use std::sync::Arc;

use assert_matches::assert_matches;
use bson::{Bson, doc};
use rmongo_wire::MessageSettings;
use rmongo_wire::command::WriteCommand;

use super::*;
use crate::debug::ConnectionDebugger;
use crate::error::Error;
use crate::protocol::write::WriteConcern;
use crate::protocol::{Connection, Namespace};
use crate::test_util::{MockReply, MockStream};
use crate::transport::OperationContext;

fn connection(stream: Arc<MockStream>, settings: MessageSettings) -> Connection {
	Connection::new(stream, ConnectionDebugger::off(), settings)
}

#[test]
fn index_map_translates_physical_to_logical() {
	let map = IndexMap::new(10, 3);
	assert_eq!(map.map(0), 10);
	assert_eq!(map.map(2), 12);
	assert_eq!(map.count(), 3);
}

#[test]
fn combiner_aggregates_counts_and_upserts() {
	let mut combiner = BulkWriteBatchCombiner::new(true);
	combiner.add_response(
		BatchKind::Update,
		&doc! { "ok": 1, "n": 3, "nModified": 2, "upserted": [ { "index": 1, "_id": 7 } ] },
		&IndexMap::new(4, 2),
	);
	let result = combiner.into_result().unwrap();
	assert_eq!(result.matched_count, 2);
	assert_eq!(result.modified_count, 2);
	assert_eq!(result.upserts, vec![(5, Bson::Int32(7))]);
}

#[test]
fn combiner_maps_write_errors_to_logical_indices() {
	let mut combiner = BulkWriteBatchCombiner::new(false);
	combiner.add_response(
		BatchKind::Insert,
		&doc! {
			"ok": 1,
			"n": 1,
			"writeErrors": [ { "index": 1, "code": 11000, "errmsg": "dup" } ],
		},
		&IndexMap::new(2, 2),
	);
	assert!(!combiner.should_stop());
	let err = combiner.into_result().unwrap_err();
	assert_matches!(err, Error::BulkWrite { ref failures, .. } if failures[0].index == 3);
}

#[test]
fn ordered_combiner_stops_after_an_error() {
	let mut combiner = BulkWriteBatchCombiner::new(true);
	combiner.add_response(
		BatchKind::Insert,
		&doc! { "ok": 1, "n": 0, "writeErrors": [ { "index": 0, "code": 1, "errmsg": "x" } ] },
		&IndexMap::new(0, 1),
	);
	assert!(combiner.should_stop());
}

#[tokio::test]
async fn single_batch_bulk_insert() {
	let stream = Arc::new(MockStream::new());
	stream.enqueue_reply(MockReply::ok(vec![doc! { "ok": 1, "n": 2 }]));
	let conn = connection(stream.clone(), MessageSettings::default());
	let ctx = OperationContext::default();

	let result = conn
		.execute_write_command(
			&Namespace::new("db", "c"),
			WriteCommand::Insert(vec![doc! { "_id": 1 }, doc! { "_id": 2 }]),
			true,
			&WriteConcern::ACKNOWLEDGED,
			&ctx,
		)
		.await
		.unwrap();
	assert_eq!(result.inserted_count, 2);
	assert_eq!(stream.written_messages().len(), 1);
}

#[tokio::test]
async fn batches_are_sent_sequentially_until_exhausted() {
	let stream = Arc::new(MockStream::new());
	// One reply per physical batch, each materialized after its batch is sent.
	for _ in 0..5 {
		stream.enqueue_reply(MockReply::ok(vec![doc! { "ok": 1, "n": 1 }]));
	}
	let settings = MessageSettings {
		max_batch_count: 1,
		..MessageSettings::default()
	};
	let conn = connection(stream.clone(), settings);
	let ctx = OperationContext::default();

	let documents: Vec<_> = (0..5).map(|i| doc! { "_id": i }).collect();
	let result = conn
		.execute_write_command(
			&Namespace::new("db", "c"),
			WriteCommand::Insert(documents),
			true,
			&WriteConcern::ACKNOWLEDGED,
			&ctx,
		)
		.await
		.unwrap();
	assert_eq!(result.inserted_count, 5);
	assert_eq!(stream.written_messages().len(), 5);
}

#[tokio::test]
async fn ordered_bulk_stops_sending_after_a_write_error() {
	let stream = Arc::new(MockStream::new());
	stream.enqueue_reply(MockReply::ok(vec![doc! {
		"ok": 1,
		"n": 0,
		"writeErrors": [ { "index": 0, "code": 11000, "errmsg": "dup" } ],
	}]));
	let settings = MessageSettings {
		max_batch_count: 1,
		..MessageSettings::default()
	};
	let conn = connection(stream.clone(), settings);
	let ctx = OperationContext::default();

	let err = conn
		.execute_write_command(
			&Namespace::new("db", "c"),
			WriteCommand::Insert(vec![doc! { "_id": 1 }, doc! { "_id": 2 }]),
			true,
			&WriteConcern::ACKNOWLEDGED,
			&ctx,
		)
		.await
		.unwrap_err();

	// The second batch was never sent.
	assert_eq!(stream.written_messages().len(), 1);
	assert_matches!(
		err,
		Error::BulkWrite { ref failures, .. }
			if failures.len() == 1 && failures[0].index == 0 && failures[0].code == 11000
	);
}

#[tokio::test]
async fn unordered_bulk_merges_errors_across_batches() {
	let stream = Arc::new(MockStream::new());
	stream.enqueue_reply(MockReply::ok(vec![doc! {
		"ok": 1,
		"n": 0,
		"writeErrors": [ { "index": 0, "code": 11000, "errmsg": "dup" } ],
	}]));
	stream.enqueue_reply(MockReply::ok(vec![doc! { "ok": 1, "n": 1 }]));
	let settings = MessageSettings {
		max_batch_count: 1,
		..MessageSettings::default()
	};
	let conn = connection(stream.clone(), settings);
	let ctx = OperationContext::default();

	let err = conn
		.execute_write_command(
			&Namespace::new("db", "c"),
			WriteCommand::Insert(vec![doc! { "_id": 1 }, doc! { "_id": 2 }]),
			false,
			&WriteConcern::ACKNOWLEDGED,
			&ctx,
		)
		.await
		.unwrap_err();

	assert_eq!(stream.written_messages().len(), 2);
	assert_matches!(
		err,
		Error::BulkWrite { ref partial, .. } if partial.inserted_count == 1
	);
}

#[tokio::test]
async fn non_ok_batch_reply_raises_a_command_failure() {
	let stream = Arc::new(MockStream::new());
	stream.enqueue_reply(MockReply::ok(vec![
		doc! { "ok": 0, "code": 13, "errmsg": "unauthorized" },
	]));
	let conn = connection(stream, MessageSettings::default());
	let ctx = OperationContext::default();

	let err = conn
		.execute_write_command(
			&Namespace::new("db", "c"),
			WriteCommand::Insert(vec![doc! { "_id": 1 }]),
			true,
			&WriteConcern::ACKNOWLEDGED,
			&ctx,
		)
		.await
		.unwrap_err();
	assert_matches!(err, Error::CommandFailure { code: 13, .. });
}
