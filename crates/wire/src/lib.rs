pub mod command;
pub mod header;
pub mod message;
pub mod reply;

pub use command::{DeleteRequest, EncodedBatch, UpdateRequest, WriteCommand, WriteCommandMessage};
pub use header::{HEADER_LEN, MessageHeader, OpCode, REPLY_HEADER_LEN, ReplyHeader, next_request_id};
pub use message::{
	CommandMessage, DeleteMessage, GetMoreMessage, InsertMessage, KillCursorsMessage, QueryMessage,
	UpdateMessage,
};
pub use reply::{BsonDecoder, DocumentDecoder, Reply, decode_documents};

/// Server-advertised limits the codec must respect when framing messages.
#[derive(Debug, Clone, Copy)]
pub struct MessageSettings {
	pub max_document_size: i32,
	pub max_message_size: i32,
	pub max_batch_count: i32,
}

impl Default for MessageSettings {
	fn default() -> Self {
		Self {
			max_document_size: 16 * 1024 * 1024,
			max_message_size: 48_000_000,
			max_batch_count: 1000,
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
	#[error("invalid message header: length {length} outside [16, {max}]")]
	InvalidMessageHeader { length: i32, max: i32 },
	#[error("invalid reply header: {reason}")]
	InvalidReplyHeader { reason: String },
	#[error("invalid reply: expected response to {expected}, got a reply to {actual}")]
	InvalidReply { expected: i32, actual: i32 },
	#[error("document of {size} bytes exceeds the maximum of {max}")]
	DocumentTooLarge { size: usize, max: i32 },
	#[error("message of {size} bytes exceeds the maximum of {max}")]
	MessageTooLarge { size: usize, max: i32 },
	#[error("malformed BSON document in message body")]
	MalformedDocument(#[source] Box<bson::de::Error>),
	#[error("failed to encode BSON document")]
	DocumentEncode(#[source] Box<bson::ser::Error>),
}

impl From<bson::de::Error> for WireError {
	fn from(e: bson::de::Error) -> Self {
		WireError::MalformedDocument(Box::new(e))
	}
}

impl From<bson::ser::Error> for WireError {
	fn from(e: bson::ser::Error) -> Self {
		WireError::DocumentEncode(Box::new(e))
	}
}
