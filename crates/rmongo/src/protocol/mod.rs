pub mod bulk;
pub mod command;
pub mod cursor;
pub mod write;

use std::fmt;
use std::sync::Arc;

use bson::Document;
use rmongo_core::buf::{ByteBuf, CompositeBuf};
use rmongo_wire::header::{HEADER_LEN, MessageHeader, OpCode, ReplyHeader};
use rmongo_wire::reply::{DocumentDecoder, decode_documents};
use rmongo_wire::{MessageSettings, Reply, WireError};

use crate::debug::{ConnectionDebugger, EventType, OperationCode};
use crate::error::{Error, Result, error_code, error_message};
use crate::transport::{OperationContext, Stream};

/// A fully qualified collection name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
	pub database: String,
	pub collection: String,
}

impl Namespace {
	pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
		Self {
			database: database.into(),
			collection: collection.into(),
		}
	}

	pub fn full_name(&self) -> String {
		format!("{}.{}", self.database, self.collection)
	}
}

impl fmt::Display for Namespace {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}", self.database, self.collection)
	}
}

/// One conversation over one stream: encode, send, receive, decode, classify.
/// Blocking entry points reuse the same async state machine through the latch
/// adapter; nothing here is duplicated per form.
#[derive(Clone)]
pub struct Connection {
	stream: Arc<dyn Stream>,
	debugger: ConnectionDebugger,
	message_settings: MessageSettings,
}

impl Connection {
	pub fn new(
		stream: Arc<dyn Stream>,
		debugger: ConnectionDebugger,
		message_settings: MessageSettings,
	) -> Self {
		Self {
			stream,
			debugger,
			message_settings,
		}
	}

	pub fn stream(&self) -> &Arc<dyn Stream> {
		&self.stream
	}

	pub fn debugger(&self) -> &ConnectionDebugger {
		&self.debugger
	}

	pub fn message_settings(&self) -> &MessageSettings {
		&self.message_settings
	}

	/// Encodes through `encode`, sends, and releases the outbound buffer.
	pub(crate) async fn send_message<E>(&self, ctx: &OperationContext, encode: E) -> Result<()>
	where
		E: FnOnce(&mut ByteBuf) -> Result<()>,
	{
		let mut buf = self
			.stream
			.get_buffer(self.message_settings.max_message_size as usize);
		if let Err(e) = encode(&mut buf) {
			buf.release();
			return Err(e);
		}
		buf.flip();
		let result = self.stream.write(std::slice::from_ref(&buf), ctx).await;
		buf.release();
		result
	}

	/// Receives and decodes the reply correlated to `awaiting_request_id`.
	/// Every decode boundary is a debugger connection-op event; structural
	/// failures are always reported before they are raised.
	pub async fn receive_reply<C>(
		&self,
		awaiting_request_id: i32,
		decoder: &C,
		ctx: &OperationContext,
	) -> Result<Reply<C::Document>>
	where
		C: DocumentDecoder + Sync,
		C::Document: Send,
	{
		let mut header_buf = self.stream.read(HEADER_LEN as i32, ctx).await?;
		let header_result = self.decode_message_header(&mut header_buf, ctx);
		header_buf.release();
		let header = header_result?;

		let mut body = self.stream.read(header.body_length(), ctx).await?;
		let reply_result = self.decode_reply(header, &mut body, awaiting_request_id, decoder, ctx);
		body.release();
		reply_result
	}

	fn decode_message_header(
		&self,
		buf: &mut CompositeBuf,
		ctx: &OperationContext,
	) -> Result<MessageHeader> {
		let debugger = self.debugger.enabled();
		if let Some(d) = debugger {
			d.record_connection_op(
				ctx.mode,
				OperationCode::DecodeMessageHeader,
				EventType::Begin,
				Vec::new(),
			);
		}
		match MessageHeader::decode(buf, self.message_settings.max_message_size) {
			Ok(header) => {
				if let Some(d) = debugger {
					d.record_connection_op(
						ctx.mode,
						OperationCode::DecodeMessageHeader,
						EventType::EndSuccess,
						vec![format!("length={}", header.message_length)],
					);
				}
				Ok(header)
			},
			Err(e) => match debugger {
				Some(d) => Err(d.fail_connection_op(
					ctx.mode,
					OperationCode::DecodeMessageHeader,
					Error::Wire(e),
				)),
				None => Err(Error::Wire(e)),
			},
		}
	}

	fn decode_reply<C>(
		&self,
		header: MessageHeader,
		body: &mut CompositeBuf,
		awaiting_request_id: i32,
		decoder: &C,
		ctx: &OperationContext,
	) -> Result<Reply<C::Document>>
	where
		C: DocumentDecoder,
	{
		let debugger = self.debugger.enabled();

		// Reply-header phase: the op code must be OP_REPLY, then the fixed
		// reply fields follow. The message-header counters only count headers
		// that turned out to frame a real reply.
		if let Some(d) = debugger {
			d.record_connection_op(
				ctx.mode,
				OperationCode::DecodeReplyHeader,
				EventType::Begin,
				Vec::new(),
			);
		}
		let fields = match Self::decode_reply_header(header, body) {
			Ok(fields) => {
				if let Some(d) = debugger {
					d.io().decoded_header(header.message_length as i64);
					d.record_connection_op(
						ctx.mode,
						OperationCode::DecodeReplyHeader,
						EventType::EndSuccess,
						Vec::new(),
					);
				}
				fields
			},
			Err(e) => {
				return match debugger {
					Some(d) => Err(d.fail_connection_op(
						ctx.mode,
						OperationCode::DecodeReplyHeader,
						Error::Wire(e),
					)),
					None => Err(Error::Wire(e)),
				};
			},
		};

		// Reply phase: correlation check, then the documents.
		if let Some(d) = debugger {
			d.record_connection_op(
				ctx.mode,
				OperationCode::DecodeReply,
				EventType::Begin,
				Vec::new(),
			);
		}
		let decoded = (|| {
			if header.response_to != awaiting_request_id {
				return Err(WireError::InvalidReply {
					expected: awaiting_request_id,
					actual: header.response_to,
				});
			}
			decode_documents(&fields, body, decoder)
		})();
		match decoded {
			Ok(documents) => {
				if let Some(d) = debugger {
					d.record_connection_op(
						ctx.mode,
						OperationCode::DecodeReply,
						EventType::EndSuccess,
						vec![format!("documents={}", documents.len())],
					);
				}
				Ok(Reply {
					header,
					fields,
					documents,
				})
			},
			Err(e) => match debugger {
				Some(d) => Err(d.fail_connection_op(
					ctx.mode,
					OperationCode::DecodeReply,
					Error::Wire(e),
				)),
				None => Err(Error::Wire(e)),
			},
		}
	}

	fn decode_reply_header(
		header: MessageHeader,
		body: &mut CompositeBuf,
	) -> std::result::Result<ReplyHeader, WireError> {
		if header.op_code != OpCode::Reply as i32 {
			return Err(WireError::InvalidReplyHeader {
				reason: format!("unexpected op code {}", header.op_code),
			});
		}
		ReplyHeader::decode(body)
	}
}

/// Classifies reply flags: a gone cursor and server-side query failures are
/// surfaced as typed errors before any document is interpreted as a result.
pub(crate) fn check_reply_flags(reply: &Reply<Document>, cursor_id: i64) -> Result<()> {
	if reply.fields.is_cursor_not_found() {
		return Err(Error::CursorNotFound { cursor_id });
	}
	if reply.fields.is_query_failure() {
		let (code, message) = reply
			.documents
			.first()
			.map(|doc| (error_code(doc), error_message(doc)))
			.unwrap_or((-1, "query failure with an empty reply".to_string()));
		return Err(Error::QueryFailure { code, message });
	}
	Ok(())
}

/// Pulls the single result document out of a command reply.
pub(crate) fn single_document(reply: Reply<Document>) -> Result<Document> {
	let count = reply.documents.len();
	reply
		.documents
		.into_iter()
		.next()
		.ok_or_else(|| Error::Wire(WireError::InvalidReplyHeader {
			reason: format!("expected one reply document, got {count}"),
		}))
}
