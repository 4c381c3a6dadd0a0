use std::fmt;
use std::sync::Mutex;

// Event storage for the invariant recorder: a fixed-size ring of typed,
// object-reused events per collector, plus the mutex-guarded I/O counters.

/// How the operation was entered: through the async API, a blocking adapter,
/// or a path with no invocation context (close).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
	Sync,
	Async,
	Unknown,
}

impl fmt::Display for OperationMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			OperationMode::Sync => f.write_str("SYNC"),
			OperationMode::Async => f.write_str("ASYNC"),
			OperationMode::Unknown => f.write_str("UNKNOWN"),
		}
	}
}

/// Stream-level and connection-level operation codes. The stream collector
/// records the first four; the connection collector records the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationCode {
	Open,
	Read,
	Write,
	Close,
	Command,
	DecodeMessageHeader,
	DecodeReplyHeader,
	DecodeReply,
}

impl fmt::Display for OperationCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			OperationCode::Open => "OPEN",
			OperationCode::Read => "READ",
			OperationCode::Write => "WRITE",
			OperationCode::Close => "CLOSE",
			OperationCode::Command => "COMMAND",
			OperationCode::DecodeMessageHeader => "DECODE_MESSAGE_HEADER",
			OperationCode::DecodeReplyHeader => "DECODE_REPLY_HEADER",
			OperationCode::DecodeReply => "DECODE_REPLY",
		};
		f.write_str(s)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
	Begin,
	EndSuccess,
	EndFailure,
}

impl fmt::Display for EventType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			EventType::Begin => f.write_str("BEGIN"),
			EventType::EndSuccess => f.write_str("END_SUCCESS"),
			EventType::EndFailure => f.write_str("END_FAILURE"),
		}
	}
}

#[derive(Debug, Clone)]
pub struct OperationEvent {
	pub mode: OperationMode,
	pub code: OperationCode,
	pub event_type: EventType,
	pub attachments: Vec<String>,
}

impl OperationEvent {
	fn placeholder() -> Self {
		Self {
			mode: OperationMode::Unknown,
			code: OperationCode::Close,
			event_type: EventType::Begin,
			attachments: Vec::new(),
		}
	}
}

/// Floor-modulo ring index, defined on negative linear indices so the
/// "before the first event" state (-1) is well formed.
pub fn ring_index(linear_index: i64, size: usize) -> usize {
	let size = size as i64;
	(((linear_index % size) + size) % size) as usize
}

/// Whether `next` may legally follow `prev`. CLOSE interleaves with anything;
/// otherwise a BEGIN must be closed by a matching END before the next BEGIN,
/// and nothing but CLOSE may follow END_FAILURE.
fn can_be_followed_by(prev: &OperationEvent, next: &OperationEvent) -> bool {
	if prev.code == OperationCode::Close || next.code == OperationCode::Close {
		return true;
	}
	match prev.event_type {
		EventType::Begin => {
			next.code == prev.code
				&& matches!(next.event_type, EventType::EndSuccess | EventType::EndFailure)
		},
		EventType::EndSuccess => next.event_type == EventType::Begin,
		EventType::EndFailure => false,
	}
}

/// An illegal ordering detected while recording; turned into an enriched
/// debugging error by the owning debugger.
#[derive(Debug)]
pub struct OrderViolation {
	pub collector: &'static str,
	pub index: i64,
	pub mode: OperationMode,
	pub code: OperationCode,
	pub event_type: EventType,
}

impl fmt::Display for OrderViolation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"illegal event ordering in the {} collector: event #{} {} {} ({}) cannot follow its predecessor",
			self.collector, self.index, self.event_type, self.code, self.mode
		)
	}
}

struct RingState {
	events: Vec<OperationEvent>,
	last_index: i64,
}

/// A ring of operation events. Events are overwritten in place as the ring
/// advances; the newest entry replaces the oldest.
pub struct OperationCollector {
	name: &'static str,
	enforce_order: bool,
	state: Mutex<RingState>,
}

impl OperationCollector {
	pub fn new(name: &'static str, enforce_order: bool, size: usize) -> Self {
		assert!(size >= 2, "event history must hold at least two events");
		Self {
			name,
			enforce_order,
			state: Mutex::new(RingState {
				events: vec![OperationEvent::placeholder(); size],
				last_index: -1,
			}),
		}
	}

	/// Records an event, returning the ordering violation if this collector
	/// enforces ordering and the event is out of place. The event is recorded
	/// either way, so the history shows what actually happened.
	pub fn record(
		&self,
		mode: OperationMode,
		code: OperationCode,
		event_type: EventType,
		attachments: Vec<String>,
	) -> Result<(), OrderViolation> {
		let mut state = self.state.lock().unwrap();
		let size = state.events.len();
		let valid = if state.last_index < 0 {
			event_type == EventType::Begin
		} else {
			let prev = &state.events[ring_index(state.last_index, size)];
			let candidate = OperationEvent {
				mode,
				code,
				event_type,
				attachments: Vec::new(),
			};
			can_be_followed_by(prev, &candidate)
		};
		state.last_index += 1;
		let index = state.last_index;
		let slot = ring_index(index, size);
		// Reuse the slot in place.
		let event = &mut state.events[slot];
		event.mode = mode;
		event.code = code;
		event.event_type = event_type;
		event.attachments.clear();
		event.attachments.extend(attachments);

		if self.enforce_order && !valid {
			return Err(OrderViolation {
				collector: self.name,
				index,
				mode,
				code,
				event_type,
			});
		}
		Ok(())
	}

	pub fn last_index(&self) -> i64 {
		self.state.lock().unwrap().last_index
	}

	/// Oldest-to-newest copy of the retained history.
	pub fn history(&self) -> Vec<OperationEvent> {
		let state = self.state.lock().unwrap();
		let size = state.events.len() as i64;
		if state.last_index < 0 {
			return Vec::new();
		}
		let first = (state.last_index + 1 - size).max(0);
		(first..=state.last_index)
			.map(|i| state.events[ring_index(i, state.events.len())].clone())
			.collect()
	}

	pub fn describe(&self) -> String {
		let state = self.state.lock().unwrap();
		let size = state.events.len() as i64;
		if state.last_index < 0 {
			return format!("{}: <no events>", self.name);
		}
		let first = (state.last_index + 1 - size).max(0);
		let entries: Vec<String> = (first..=state.last_index)
			.map(|i| {
				let e = &state.events[ring_index(i, state.events.len())];
				if e.attachments.is_empty() {
					format!("#{} {} {} ({})", i, e.event_type, e.code, e.mode)
				} else {
					format!(
						"#{} {} {} ({}) {:?}",
						i, e.event_type, e.code, e.mode, e.attachments
					)
				}
			})
			.collect();
		format!("{}: [{}]", self.name, entries.join(", "))
	}
}

/// Monotonic per-connection I/O counters. Guarded by a mutex rather than made
/// atomic because the read-position snapshot must be consistent across two
/// counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoCounterSnapshot {
	pub successful_reads: i64,
	pub successful_read_bytes: i64,
	pub message_headers: i64,
	pub decoded_message_length_sum: i64,
	pub failed_reads: i64,
	pub failed_read_bytes: i64,
	pub failed_negative_reads: i64,
	pub successful_writes: i64,
	pub failed_writes: i64,
}

#[derive(Debug, Default)]
pub struct IoCounters {
	state: Mutex<IoCounterSnapshot>,
}

impl IoCounters {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn succeeded_read(&self, bytes: i64) {
		let mut s = self.state.lock().unwrap();
		s.successful_reads += 1;
		s.successful_read_bytes += bytes;
	}

	/// Counts a failed read. A negative byte count is a pathological caller
	/// bug; it lands in its own counter and the caller must raise it through
	/// the debugger. Returns true exactly in that negative case.
	pub fn failed_read(&self, bytes: i64) -> bool {
		let mut s = self.state.lock().unwrap();
		if bytes < 0 {
			s.failed_negative_reads += 1;
			true
		} else {
			s.failed_reads += 1;
			s.failed_read_bytes += bytes;
			false
		}
	}

	/// Counts a successfully decoded message header and its framed length.
	pub fn decoded_header(&self, message_length: i64) {
		let mut s = self.state.lock().unwrap();
		s.message_headers += 1;
		s.decoded_message_length_sum += message_length;
	}

	pub fn succeeded_write(&self) {
		self.state.lock().unwrap().successful_writes += 1;
	}

	pub fn failed_write(&self) {
		self.state.lock().unwrap().failed_writes += 1;
	}

	/// Consistent pair (successful read bytes, decoded message length sum),
	/// captured under one lock acquisition.
	pub fn stream_read_position(&self) -> (i64, i64) {
		let s = self.state.lock().unwrap();
		(s.successful_read_bytes, s.decoded_message_length_sum)
	}

	pub fn snapshot(&self) -> IoCounterSnapshot {
		*self.state.lock().unwrap()
	}

	pub fn describe(&self) -> String {
		let s = self.snapshot();
		format!(
			"reads={}/{}B headers={} lengthSum={} failedReads={}/{}B negativeReads={} writes={} failedWrites={}",
			s.successful_reads,
			s.successful_read_bytes,
			s.message_headers,
			s.decoded_message_length_sum,
			s.failed_reads,
			s.failed_read_bytes,
			s.failed_negative_reads,
			s.successful_writes,
			s.failed_writes
		)
	}
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
