use bson::Document;
use rmongo_core::buf::ByteBuf;

use crate::header::{MessageHeader, OpCode, next_request_id};
use crate::{MessageSettings, WireError};

// Legacy request messages. Every encoder writes a header with a tentative
// length, the payload, then back-patches the real length into the first four
// bytes. A logical write never spans messages here; only the write-command
// path (command.rs) splits.

pub(crate) fn put_cstring(buf: &mut ByteBuf, s: &str) {
	debug_assert!(!s.as_bytes().contains(&0), "embedded NUL in cstring");
	buf.put_slice(s.as_bytes());
	buf.put_u8(0);
}

pub(crate) fn encode_document(doc: &Document, max_size: i32) -> Result<Vec<u8>, WireError> {
	let mut out = Vec::new();
	doc.to_writer(&mut out)?;
	if out.len() > max_size as usize {
		return Err(WireError::DocumentTooLarge {
			size: out.len(),
			max: max_size,
		});
	}
	Ok(out)
}

pub(crate) fn start_frame(buf: &mut ByteBuf, request_id: i32, op_code: OpCode) -> usize {
	let start = buf.position();
	MessageHeader {
		message_length: 0,
		request_id,
		response_to: 0,
		op_code: op_code as i32,
	}
	.encode(buf);
	start
}

pub(crate) fn finish_frame(
	buf: &mut ByteBuf,
	start: usize,
	settings: &MessageSettings,
) -> Result<i32, WireError> {
	let length = (buf.position() - start) as i32;
	if length > settings.max_message_size {
		return Err(WireError::MessageTooLarge {
			size: length as usize,
			max: settings.max_message_size,
		});
	}
	buf.set_i32_le(start, length);
	Ok(length)
}

#[derive(Debug)]
pub struct QueryMessage {
	request_id: i32,
	pub collection_full_name: String,
	pub flags: i32,
	pub number_to_skip: i32,
	pub number_to_return: i32,
	pub query: Document,
	pub fields: Option<Document>,
}

impl QueryMessage {
	pub fn new(collection_full_name: impl Into<String>, query: Document) -> Self {
		Self {
			request_id: next_request_id(),
			collection_full_name: collection_full_name.into(),
			flags: 0,
			number_to_skip: 0,
			number_to_return: 0,
			query,
			fields: None,
		}
	}

	pub fn request_id(&self) -> i32 {
		self.request_id
	}

	pub fn encode(&self, buf: &mut ByteBuf, settings: &MessageSettings) -> Result<(), WireError> {
		let start = start_frame(buf, self.request_id, OpCode::Query);
		buf.put_i32_le(self.flags);
		put_cstring(buf, &self.collection_full_name);
		buf.put_i32_le(self.number_to_skip);
		buf.put_i32_le(self.number_to_return);
		buf.put_slice(&encode_document(&self.query, settings.max_document_size)?);
		if let Some(fields) = &self.fields {
			buf.put_slice(&encode_document(fields, settings.max_document_size)?);
		}
		finish_frame(buf, start, settings)?;
		Ok(())
	}
}

/// A command rides OP_QUERY against the database's $cmd collection with
/// number-to-return pinned to -1 (exactly one reply document).
#[derive(Debug)]
pub struct CommandMessage {
	inner: QueryMessage,
}

impl CommandMessage {
	pub fn new(database: &str, command: Document) -> Self {
		let mut inner = QueryMessage::new(format!("{database}.$cmd"), command);
		inner.number_to_return = -1;
		Self { inner }
	}

	pub fn request_id(&self) -> i32 {
		self.inner.request_id()
	}

	pub fn encode(&self, buf: &mut ByteBuf, settings: &MessageSettings) -> Result<(), WireError> {
		self.inner.encode(buf, settings)
	}
}

#[derive(Debug)]
pub struct GetMoreMessage {
	request_id: i32,
	pub collection_full_name: String,
	pub number_to_return: i32,
	pub cursor_id: i64,
}

impl GetMoreMessage {
	pub fn new(collection_full_name: impl Into<String>, cursor_id: i64, number_to_return: i32) -> Self {
		Self {
			request_id: next_request_id(),
			collection_full_name: collection_full_name.into(),
			number_to_return,
			cursor_id,
		}
	}

	pub fn request_id(&self) -> i32 {
		self.request_id
	}

	pub fn encode(&self, buf: &mut ByteBuf, settings: &MessageSettings) -> Result<(), WireError> {
		let start = start_frame(buf, self.request_id, OpCode::GetMore);
		buf.put_i32_le(0);
		put_cstring(buf, &self.collection_full_name);
		buf.put_i32_le(self.number_to_return);
		buf.put_i64_le(self.cursor_id);
		finish_frame(buf, start, settings)?;
		Ok(())
	}
}

#[derive(Debug)]
pub struct InsertMessage {
	request_id: i32,
	pub collection_full_name: String,
	pub continue_on_error: bool,
	pub documents: Vec<Document>,
}

impl InsertMessage {
	pub fn new(collection_full_name: impl Into<String>, documents: Vec<Document>) -> Self {
		Self {
			request_id: next_request_id(),
			collection_full_name: collection_full_name.into(),
			continue_on_error: false,
			documents,
		}
	}

	pub fn request_id(&self) -> i32 {
		self.request_id
	}

	pub fn encode(&self, buf: &mut ByteBuf, settings: &MessageSettings) -> Result<(), WireError> {
		let start = start_frame(buf, self.request_id, OpCode::Insert);
		buf.put_i32_le(if self.continue_on_error { 1 } else { 0 });
		put_cstring(buf, &self.collection_full_name);
		for doc in &self.documents {
			buf.put_slice(&encode_document(doc, settings.max_document_size)?);
		}
		finish_frame(buf, start, settings)?;
		Ok(())
	}
}

pub mod update_flags {
	pub const UPSERT: i32 = 1;
	pub const MULTI: i32 = 2;
}

#[derive(Debug)]
pub struct UpdateMessage {
	request_id: i32,
	pub collection_full_name: String,
	pub upsert: bool,
	pub multi: bool,
	pub filter: Document,
	pub update: Document,
}

impl UpdateMessage {
	pub fn new(collection_full_name: impl Into<String>, filter: Document, update: Document) -> Self {
		Self {
			request_id: next_request_id(),
			collection_full_name: collection_full_name.into(),
			upsert: false,
			multi: false,
			filter,
			update,
		}
	}

	pub fn request_id(&self) -> i32 {
		self.request_id
	}

	pub fn encode(&self, buf: &mut ByteBuf, settings: &MessageSettings) -> Result<(), WireError> {
		let start = start_frame(buf, self.request_id, OpCode::Update);
		buf.put_i32_le(0);
		put_cstring(buf, &self.collection_full_name);
		let mut flags = 0;
		if self.upsert {
			flags |= update_flags::UPSERT;
		}
		if self.multi {
			flags |= update_flags::MULTI;
		}
		buf.put_i32_le(flags);
		buf.put_slice(&encode_document(&self.filter, settings.max_document_size)?);
		buf.put_slice(&encode_document(&self.update, settings.max_document_size)?);
		finish_frame(buf, start, settings)?;
		Ok(())
	}
}

#[derive(Debug)]
pub struct DeleteMessage {
	request_id: i32,
	pub collection_full_name: String,
	pub single_remove: bool,
	pub filter: Document,
}

impl DeleteMessage {
	pub fn new(collection_full_name: impl Into<String>, filter: Document) -> Self {
		Self {
			request_id: next_request_id(),
			collection_full_name: collection_full_name.into(),
			single_remove: false,
			filter,
		}
	}

	pub fn request_id(&self) -> i32 {
		self.request_id
	}

	pub fn encode(&self, buf: &mut ByteBuf, settings: &MessageSettings) -> Result<(), WireError> {
		let start = start_frame(buf, self.request_id, OpCode::Delete);
		buf.put_i32_le(0);
		put_cstring(buf, &self.collection_full_name);
		buf.put_i32_le(if self.single_remove { 1 } else { 0 });
		buf.put_slice(&encode_document(&self.filter, settings.max_document_size)?);
		finish_frame(buf, start, settings)?;
		Ok(())
	}
}

#[derive(Debug)]
pub struct KillCursorsMessage {
	request_id: i32,
	pub cursor_ids: Vec<i64>,
}

impl KillCursorsMessage {
	pub fn new(cursor_ids: Vec<i64>) -> Self {
		Self {
			request_id: next_request_id(),
			cursor_ids,
		}
	}

	pub fn request_id(&self) -> i32 {
		self.request_id
	}

	pub fn encode(&self, buf: &mut ByteBuf, settings: &MessageSettings) -> Result<(), WireError> {
		let start = start_frame(buf, self.request_id, OpCode::KillCursors);
		buf.put_i32_le(0);
		buf.put_i32_le(self.cursor_ids.len() as i32);
		for id in &self.cursor_ids {
			buf.put_i64_le(*id);
		}
		finish_frame(buf, start, settings)?;
		Ok(())
	}
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
