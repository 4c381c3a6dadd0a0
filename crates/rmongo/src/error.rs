use bson::{Bson, Document};
use rmongo_wire::WireError;

use crate::debug::DebuggingError;
use crate::protocol::bulk::{BulkWriteFailure, BulkWriteResult};

pub type Result<T> = std::result::Result<T, Error>;

/// Server error codes that mean a unique-index violation.
pub const DUPLICATE_KEY_CODES: &[i32] = &[11000, 11001, 12582];
/// Server error codes that mean the operation exceeded its time limit.
pub const EXECUTION_TIMEOUT_CODES: &[i32] = &[50];

#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// Every resolved candidate address refused the connection.
	#[error("unable to open a socket to {address}")]
	SocketOpen {
		address: String,
		#[source]
		source: Option<std::io::Error>,
	},
	#[error("socket error on {address}: {message}")]
	Socket { address: String, message: String },
	#[error("timed out reading from {address}")]
	ReadTimeout { address: String },
	#[error("interrupted while waiting for a blocking call to complete")]
	Interrupted,
	/// A logic error in the caller, not an I/O condition.
	#[error("attempted to read a negative number of bytes ({requested})")]
	NegativeRead { requested: i32 },
	#[error(transparent)]
	Wire(#[from] WireError),
	#[error("command failed with code {code}: {message}")]
	CommandFailure {
		code: i32,
		message: String,
		response: Document,
	},
	#[error("operation exceeded its server-side time limit: {message}")]
	ExecutionTimeout {
		code: i32,
		message: String,
		response: Document,
	},
	#[error("duplicate key error ({code}): {message}")]
	DuplicateKey { code: i32, message: String },
	#[error("write failed ({code}): {message}")]
	WriteConcernFailure { code: i32, message: String },
	#[error("query failed ({code}): {message}")]
	QueryFailure { code: i32, message: String },
	#[error("cursor {cursor_id} no longer exists on the server")]
	CursorNotFound { cursor_id: i64 },
	#[error("bulk write failed: {} write error(s)", failures.len())]
	BulkWrite {
		failures: Vec<BulkWriteFailure>,
		write_concern_error: Option<Document>,
		partial: BulkWriteResult,
	},
	#[error(transparent)]
	Debugging(#[from] DebuggingError),
	#[error("invalid configuration: {0}")]
	Configuration(String),
}

impl Error {
	pub(crate) fn socket(address: impl Into<String>, message: impl Into<String>) -> Error {
		Error::Socket {
			address: address.into(),
			message: message.into(),
		}
	}
}

/// `ok` is truthy as a double, integer, or boolean.
pub fn reply_ok(doc: &Document) -> bool {
	match doc.get("ok") {
		Some(Bson::Double(v)) => *v != 0.0,
		Some(Bson::Int32(v)) => *v != 0,
		Some(Bson::Int64(v)) => *v != 0,
		Some(Bson::Boolean(v)) => *v,
		_ => false,
	}
}

pub fn error_code(doc: &Document) -> i32 {
	match doc.get("code") {
		Some(Bson::Int32(v)) => *v,
		Some(Bson::Int64(v)) => *v as i32,
		_ => -1,
	}
}

pub fn error_message(doc: &Document) -> String {
	for key in ["errmsg", "$err", "err"] {
		if let Some(Bson::String(s)) = doc.get(key) {
			return s.clone();
		}
	}
	"unknown error".to_string()
}

/// Classifies a non-ok command reply document.
pub fn command_failure(response: Document) -> Error {
	let code = error_code(&response);
	let message = error_message(&response);
	if EXECUTION_TIMEOUT_CODES.contains(&code) {
		Error::ExecutionTimeout {
			code,
			message,
			response,
		}
	} else {
		Error::CommandFailure {
			code,
			message,
			response,
		}
	}
}

/// Classifies a write failure reported through `err`/`code` fields.
pub fn write_failure(code: i32, message: String) -> Error {
	if DUPLICATE_KEY_CODES.contains(&code) {
		Error::DuplicateKey { code, message }
	} else {
		Error::WriteConcernFailure { code, message }
	}
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
