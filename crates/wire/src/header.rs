use std::sync::atomic::{AtomicI32, Ordering};

use bytes::Buf;
use rmongo_core::buf::ByteBuf;

use crate::WireError;

/// Fixed message header size: length, request id, response-to, op code.
pub const HEADER_LEN: usize = 16;
/// Reply extension: response flags, cursor id, starting-from, number returned.
pub const REPLY_HEADER_LEN: usize = 20;

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Process-wide monotonically increasing request id.
pub fn next_request_id() -> i32 {
	NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OpCode {
	Reply = 1,
	Update = 2001,
	Insert = 2002,
	Query = 2004,
	GetMore = 2005,
	Delete = 2006,
	KillCursors = 2007,
}

impl OpCode {
	pub fn from_i32(v: i32) -> Option<OpCode> {
		match v {
			1 => Some(OpCode::Reply),
			2001 => Some(OpCode::Update),
			2002 => Some(OpCode::Insert),
			2004 => Some(OpCode::Query),
			2005 => Some(OpCode::GetMore),
			2006 => Some(OpCode::Delete),
			2007 => Some(OpCode::KillCursors),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
	pub message_length: i32,
	pub request_id: i32,
	pub response_to: i32,
	pub op_code: i32,
}

impl MessageHeader {
	pub fn encode(&self, buf: &mut ByteBuf) {
		buf.put_i32_le(self.message_length);
		buf.put_i32_le(self.request_id);
		buf.put_i32_le(self.response_to);
		buf.put_i32_le(self.op_code);
	}

	/// Decodes sixteen bytes and validates the framed length. The caller is
	/// responsible for having read exactly enough bytes off the stream.
	pub fn decode(buf: &mut impl Buf, max_message_size: i32) -> Result<Self, WireError> {
		let header = Self {
			message_length: buf.get_i32_le(),
			request_id: buf.get_i32_le(),
			response_to: buf.get_i32_le(),
			op_code: buf.get_i32_le(),
		};
		if header.message_length < HEADER_LEN as i32 || header.message_length > max_message_size {
			return Err(WireError::InvalidMessageHeader {
				length: header.message_length,
				max: max_message_size,
			});
		}
		Ok(header)
	}

	/// Payload bytes that follow the header on the wire.
	pub fn body_length(&self) -> i32 {
		self.message_length - HEADER_LEN as i32
	}
}

pub mod response_flags {
	pub const CURSOR_NOT_FOUND: i32 = 1;
	pub const QUERY_FAILURE: i32 = 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
	pub response_flags: i32,
	pub cursor_id: i64,
	pub starting_from: i32,
	pub number_returned: i32,
}

impl ReplyHeader {
	pub fn encode(&self, buf: &mut ByteBuf) {
		buf.put_i32_le(self.response_flags);
		buf.put_i64_le(self.cursor_id);
		buf.put_i32_le(self.starting_from);
		buf.put_i32_le(self.number_returned);
	}

	pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
		let header = Self {
			response_flags: buf.get_i32_le(),
			cursor_id: buf.get_i64_le(),
			starting_from: buf.get_i32_le(),
			number_returned: buf.get_i32_le(),
		};
		if header.number_returned < 0 {
			return Err(WireError::InvalidReplyHeader {
				reason: format!("negative number of returned documents: {}", header.number_returned),
			});
		}
		Ok(header)
	}

	pub fn is_cursor_not_found(&self) -> bool {
		self.response_flags & response_flags::CURSOR_NOT_FOUND != 0
	}

	pub fn is_query_failure(&self) -> bool {
		self.response_flags & response_flags::QUERY_FAILURE != 0
	}
}

#[cfg(test)]
#[path = "header_tests.rs"]
mod tests;
