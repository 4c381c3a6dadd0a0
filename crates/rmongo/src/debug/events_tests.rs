use super::*;

#[test]
fn ring_index_is_total_over_negative_indices() {
	assert_eq!(ring_index(-1, 4), 3);
	assert_eq!(ring_index(0, 4), 0);
	assert_eq!(ring_index(5, 4), 1);
	assert_eq!(ring_index(-5, 4), 3);
	for size in 2..8usize {
		for i in -20i64..20 {
			assert!(ring_index(i, size) < size);
		}
	}
}

#[test]
fn first_event_must_be_a_begin() {
	let collector = OperationCollector::new("test", true, 4);
	let violation = collector
		.record(
			OperationMode::Async,
			OperationCode::Read,
			EventType::EndSuccess,
			Vec::new(),
		)
		.unwrap_err();
	assert_eq!(violation.index, 0);
	assert_eq!(violation.code, OperationCode::Read);
}

#[test]
fn begin_end_pairs_are_legal() {
	let collector = OperationCollector::new("test", true, 4);
	for code in [OperationCode::Open, OperationCode::Read, OperationCode::Write] {
		collector
			.record(OperationMode::Async, code, EventType::Begin, Vec::new())
			.unwrap();
		collector
			.record(OperationMode::Async, code, EventType::EndSuccess, Vec::new())
			.unwrap();
	}
}

#[test]
fn begin_after_begin_is_a_violation() {
	let collector = OperationCollector::new("test", true, 4);
	collector
		.record(OperationMode::Async, OperationCode::Read, EventType::Begin, Vec::new())
		.unwrap();
	let violation = collector
		.record(OperationMode::Async, OperationCode::Read, EventType::Begin, Vec::new())
		.unwrap_err();
	assert_eq!(violation.index, 1);
	assert_eq!(violation.event_type, EventType::Begin);
}

#[test]
fn end_of_a_different_code_is_a_violation() {
	let collector = OperationCollector::new("test", true, 4);
	collector
		.record(OperationMode::Async, OperationCode::Read, EventType::Begin, Vec::new())
		.unwrap();
	collector
		.record(OperationMode::Async, OperationCode::Write, EventType::EndSuccess, Vec::new())
		.unwrap_err();
}

#[test]
fn only_close_may_follow_end_failure() {
	let collector = OperationCollector::new("test", true, 4);
	collector
		.record(OperationMode::Async, OperationCode::Read, EventType::Begin, Vec::new())
		.unwrap();
	collector
		.record(OperationMode::Async, OperationCode::Read, EventType::EndFailure, Vec::new())
		.unwrap();
	// CLOSE is always permitted.
	collector
		.record(OperationMode::Unknown, OperationCode::Close, EventType::Begin, Vec::new())
		.unwrap();
	// After CLOSE anything goes.
	collector
		.record(OperationMode::Async, OperationCode::Open, EventType::Begin, Vec::new())
		.unwrap();
}

#[test]
fn begin_after_end_failure_is_a_violation() {
	let collector = OperationCollector::new("test", true, 4);
	collector
		.record(OperationMode::Async, OperationCode::Read, EventType::Begin, Vec::new())
		.unwrap();
	collector
		.record(OperationMode::Async, OperationCode::Read, EventType::EndFailure, Vec::new())
		.unwrap();
	collector
		.record(OperationMode::Async, OperationCode::Read, EventType::Begin, Vec::new())
		.unwrap_err();
}

#[test]
fn unordered_collector_never_raises() {
	let collector = OperationCollector::new("test", false, 4);
	collector
		.record(OperationMode::Async, OperationCode::Command, EventType::EndSuccess, Vec::new())
		.unwrap();
	collector
		.record(OperationMode::Async, OperationCode::Command, EventType::EndSuccess, Vec::new())
		.unwrap();
}

#[test]
fn ring_overwrites_oldest_event() {
	let collector = OperationCollector::new("test", true, 2);
	collector
		.record(OperationMode::Async, OperationCode::Open, EventType::Begin, Vec::new())
		.unwrap();
	collector
		.record(OperationMode::Async, OperationCode::Open, EventType::EndSuccess, Vec::new())
		.unwrap();
	collector
		.record(OperationMode::Async, OperationCode::Read, EventType::Begin, Vec::new())
		.unwrap();

	let history = collector.history();
	assert_eq!(history.len(), 2);
	assert_eq!(history[0].event_type, EventType::EndSuccess);
	assert_eq!(history[1].code, OperationCode::Read);
	assert_eq!(collector.last_index(), 2);
}

#[test]
#[should_panic(expected = "at least two")]
fn ring_smaller_than_two_is_rejected() {
	let _ = OperationCollector::new("test", true, 1);
}

#[test]
fn counters_only_grow_and_snapshot_consistently() {
	let counters = IoCounters::new();
	counters.succeeded_read(16);
	counters.succeeded_read(4);
	counters.decoded_header(36);
	counters.succeeded_write();
	assert!(!counters.failed_read(8));

	let snapshot = counters.snapshot();
	assert_eq!(snapshot.successful_reads, 2);
	assert_eq!(snapshot.successful_read_bytes, 20);
	assert_eq!(snapshot.message_headers, 1);
	assert_eq!(snapshot.decoded_message_length_sum, 36);
	assert_eq!(snapshot.failed_reads, 1);
	assert_eq!(snapshot.failed_read_bytes, 8);
	assert_eq!(snapshot.successful_writes, 1);

	assert_eq!(counters.stream_read_position(), (20, 36));
}

#[test]
fn negative_read_lands_in_its_own_counter() {
	let counters = IoCounters::new();
	assert!(counters.failed_read(-17));
	let snapshot = counters.snapshot();
	assert_eq!(snapshot.failed_negative_reads, 1);
	assert_eq!(snapshot.failed_reads, 0);
	assert_eq!(snapshot.failed_read_bytes, 0);
}
