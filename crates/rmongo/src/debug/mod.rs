pub mod events;
pub mod stream;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Deserialize;
use tracing::error;

pub use events::{
	EventType, IoCounterSnapshot, IoCounters, OperationCode, OperationCollector, OperationMode,
	OrderViolation, ring_index,
};
pub use stream::DebugStream;

use crate::error::Error;
use crate::settings::DebugSettings;

// Process-wide identity for debugger diagnostics: one run id per process,
// globally allocated debugger and message ids.
static RUN_ID: Lazy<String> = Lazy::new(|| {
	rand::rng()
		.sample_iter(&Alphanumeric)
		.take(16)
		.map(char::from)
		.collect()
});
static NEXT_DEBUGGER_ID: AtomicI64 = AtomicI64::new(0);
static NEXT_MESSAGE_ID: AtomicI64 = AtomicI64::new(0);

pub fn run_id() -> &'static str {
	&RUN_ID
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DebuggerMode {
	#[default]
	Off,
	Log,
	LogAndThrow,
}

/// An invariant violation raised by the recorder. The message is fully
/// enriched at construction; the original failure, when one exists, rides
/// along as the source.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct DebuggingError {
	message: String,
	#[source]
	source: Option<Box<Error>>,
}

impl DebuggingError {
	pub fn message(&self) -> &str {
		&self.message
	}

	pub fn cause(&self) -> Option<&Error> {
		self.source.as_deref()
	}
}

/// What the caller must do after reporting: carry on, or stop executing the
/// surrounding driver logic and complete with this error. The abort arm is how
/// the exactly-once completion guarantee survives LOG_AND_THROW on async
/// paths.
#[must_use]
#[derive(Debug)]
pub enum Verdict {
	Continue,
	Abort(DebuggingError),
}

impl Verdict {
	pub fn into_result(self) -> crate::Result<()> {
		match self {
			Verdict::Continue => Ok(()),
			Verdict::Abort(e) => Err(e.into()),
		}
	}
}

/// Per-connection runtime invariant recorder. With mode Off this is a
/// fieldless shell: no collectors exist and no event is ever constructed.
#[derive(Clone, Default)]
pub struct ConnectionDebugger {
	inner: Option<Arc<DebuggerInner>>,
}

impl ConnectionDebugger {
	pub fn new(settings: &DebugSettings) -> Self {
		let mode = match settings.mode {
			DebuggerMode::Off => return Self { inner: None },
			other => other,
		};
		let id = NEXT_DEBUGGER_ID.fetch_add(1, Ordering::Relaxed);
		Self {
			inner: Some(Arc::new(DebuggerInner {
				id,
				mode,
				io: IoCounters::new(),
				stream_ops: OperationCollector::new("streamOps", true, settings.event_history_size),
				connection_ops: OperationCollector::new(
					"connectionOps",
					false,
					settings.event_history_size,
				),
			})),
		}
	}

	pub fn off() -> Self {
		Self { inner: None }
	}

	/// The whole fast path when disabled: a single Option check.
	pub fn enabled(&self) -> Option<&DebuggerInner> {
		self.inner.as_deref()
	}
}

pub struct DebuggerInner {
	id: i64,
	mode: DebuggerMode,
	io: IoCounters,
	stream_ops: OperationCollector,
	connection_ops: OperationCollector,
}

impl DebuggerInner {
	pub fn id(&self) -> i64 {
		self.id
	}

	pub fn io(&self) -> &IoCounters {
		&self.io
	}

	pub fn stream_ops(&self) -> &OperationCollector {
		&self.stream_ops
	}

	pub fn connection_ops(&self) -> &OperationCollector {
		&self.connection_ops
	}

	/// Records a stream-level event; an ordering violation goes through
	/// [`Self::report`] and the verdict tells the caller whether to abort.
	pub fn record_stream_op(
		&self,
		mode: OperationMode,
		code: OperationCode,
		event_type: EventType,
		attachments: Vec<String>,
	) -> Verdict {
		match self.stream_ops.record(mode, code, event_type, attachments) {
			Ok(()) => Verdict::Continue,
			Err(violation) => {
				let enriched = self.enriched(&violation.to_string(), None);
				self.report(enriched)
			},
		}
	}

	/// Records a connection-level event. This collector does not enforce
	/// ordering (commands legitimately interleave with stream operations), so
	/// recording never fails.
	pub fn record_connection_op(
		&self,
		mode: OperationMode,
		code: OperationCode,
		event_type: EventType,
		attachments: Vec<String>,
	) {
		let _ = self
			.connection_ops
			.record(mode, code, event_type, attachments);
	}

	/// Records a decode failure and converts it per the reporting mode: the
	/// original error under Log, an enriched debugging error carrying the
	/// original under LogAndThrow.
	pub fn fail_connection_op(
		&self,
		mode: OperationMode,
		code: OperationCode,
		cause: Error,
	) -> Error {
		self.record_connection_op(mode, code, EventType::EndFailure, vec![cause.to_string()]);
		match self.mode {
			DebuggerMode::Log => {
				error!(debugger_id = self.id, code = %code, error = %cause, "decode failure");
				cause
			},
			DebuggerMode::LogAndThrow => {
				let enriched = self.enriched(&format!("{code} failed"), Some(cause));
				error!(debugger_id = self.id, "{}", enriched.message());
				Error::Debugging(enriched)
			},
			DebuggerMode::Off => unreachable!("an Off debugger has no inner state"),
		}
	}

	/// Counts a failed read; a negative requested count additionally yields
	/// the diagnostic the caller must report.
	pub fn failed_read(&self, bytes: i64) -> Option<DebuggingError> {
		if self.io.failed_read(bytes) {
			Some(self.enriched(
				&format!("Detected an attempt to read negative number of bytes, numberOfBytes={bytes}"),
				None,
			))
		} else {
			None
		}
	}

	/// Applies the reporting mode to a debugging error.
	pub fn report(&self, e: DebuggingError) -> Verdict {
		match self.mode {
			DebuggerMode::Log => {
				error!(debugger_id = self.id, "{}", e.message());
				Verdict::Continue
			},
			DebuggerMode::LogAndThrow => {
				error!(debugger_id = self.id, "{}", e.message());
				Verdict::Abort(e)
			},
			DebuggerMode::Off => unreachable!("an Off debugger has no inner state"),
		}
	}

	/// Builds a fully enriched debugging error: identity, fresh message id,
	/// timestamp, thread, and a snapshot of every collector.
	pub fn enriched(&self, core: &str, cause: Option<Error>) -> DebuggingError {
		let message_id = NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed);
		let timestamp = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_millis())
			.unwrap_or(0);
		let thread = std::thread::current()
			.name()
			.unwrap_or("unnamed")
			.to_string();
		let message = format!(
			"ConnectionDebugger[runId={}, debuggerId={}, messageId={}, timestamp={}, thread={}]: {}; {}",
			run_id(),
			self.id,
			message_id,
			timestamp,
			thread,
			core,
			self.describe_state()
		);
		DebuggingError {
			message,
			source: cause.map(Box::new),
		}
	}

	fn describe_state(&self) -> String {
		format!(
			"counters{{{}}}; {}; {}",
			self.io.describe(),
			self.stream_ops.describe(),
			self.connection_ops.describe()
		)
	}
}

#[cfg(test)]
#[path = "debug_tests.rs"]
mod tests;
