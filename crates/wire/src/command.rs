use bson::{Document, doc};
use rmongo_core::buf::ByteBuf;

use crate::header::{HEADER_LEN, OpCode, next_request_id};
use crate::message::{encode_document, finish_frame, put_cstring, start_frame};
use crate::{MessageSettings, WireError};

// Write commands ride OP_QUERY against `<db>.$cmd`. The item list is framed as
// a BSON array assembled at the byte level so the encoder can stop adding
// items the moment a server limit would be exceeded and hand the remainder
// back as a continuation message. Splitting here is the only way one logical
// write becomes several physical messages.

/// Extra room the command document may use beyond the max document size, to
/// cover the non-item command fields.
const COMMAND_HEADROOM: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct UpdateRequest {
	pub filter: Document,
	pub update: Document,
	pub upsert: bool,
	pub multi: bool,
}

#[derive(Debug, Clone)]
pub struct DeleteRequest {
	pub filter: Document,
	pub limit: i32,
}

#[derive(Debug, Clone)]
pub enum WriteCommand {
	Insert(Vec<Document>),
	Update(Vec<UpdateRequest>),
	Delete(Vec<DeleteRequest>),
}

impl WriteCommand {
	pub fn len(&self) -> usize {
		match self {
			WriteCommand::Insert(v) => v.len(),
			WriteCommand::Update(v) => v.len(),
			WriteCommand::Delete(v) => v.len(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Command name and the key of its item array.
	fn names(&self) -> (&'static str, &'static str) {
		match self {
			WriteCommand::Insert(_) => ("insert", "documents"),
			WriteCommand::Update(_) => ("update", "updates"),
			WriteCommand::Delete(_) => ("delete", "deletes"),
		}
	}

	fn item_document(&self, i: usize) -> Document {
		match self {
			WriteCommand::Insert(v) => v[i].clone(),
			WriteCommand::Update(v) => {
				let u = &v[i];
				doc! {
					"q": u.filter.clone(),
					"u": u.update.clone(),
					"upsert": u.upsert,
					"multi": u.multi,
				}
			},
			WriteCommand::Delete(v) => {
				let d = &v[i];
				doc! { "q": d.filter.clone(), "limit": d.limit }
			},
		}
	}

	fn split_off(&mut self, at: usize) -> WriteCommand {
		match self {
			WriteCommand::Insert(v) => WriteCommand::Insert(v.split_off(at)),
			WriteCommand::Update(v) => WriteCommand::Update(v.split_off(at)),
			WriteCommand::Delete(v) => WriteCommand::Delete(v.split_off(at)),
		}
	}
}

#[derive(Debug)]
pub struct WriteCommandMessage {
	request_id: i32,
	database: String,
	collection: String,
	ordered: bool,
	write_concern: Option<Document>,
	command: WriteCommand,
	// Logical index (in the caller's original list) of this message's first item.
	offset: usize,
}

/// Outcome of encoding one physical message.
#[derive(Debug)]
pub struct EncodedBatch {
	pub request_id: i32,
	/// Logical index of the first item covered by this message.
	pub range_start: usize,
	/// Items covered by this message.
	pub item_count: usize,
	/// The untranscoded remainder, if a server limit forced a split.
	pub continuation: Option<WriteCommandMessage>,
}

impl WriteCommandMessage {
	pub fn new(
		database: impl Into<String>,
		collection: impl Into<String>,
		ordered: bool,
		write_concern: Option<Document>,
		command: WriteCommand,
	) -> Self {
		assert!(!command.is_empty(), "write command must carry at least one item");
		Self {
			request_id: next_request_id(),
			database: database.into(),
			collection: collection.into(),
			ordered,
			write_concern,
			command,
			offset: 0,
		}
	}

	pub fn request_id(&self) -> i32 {
		self.request_id
	}

	pub fn item_count(&self) -> usize {
		self.command.len()
	}

	/// Encodes as many items as the limits allow into `buf` and returns the
	/// covered range plus the continuation carrying the remainder.
	pub fn encode_into(
		mut self,
		buf: &mut ByteBuf,
		settings: &MessageSettings,
	) -> Result<EncodedBatch, WireError> {
		let (command_name, array_key) = self.command.names();
		let mut base = doc! {
			command_name: self.collection.clone(),
			"ordered": self.ordered,
		};
		if let Some(wc) = &self.write_concern {
			base.insert("writeConcern", wc.clone());
		}
		let base_bytes = encode_document(&base, settings.max_document_size)?;
		// Elements only: drop the four-byte length prefix and the terminator.
		let base_elements = &base_bytes[4..base_bytes.len() - 1];

		// flags + "<db>.$cmd" cstring + skip + number-to-return.
		let preamble = HEADER_LEN + 4 + (self.database.len() + 6) + 4 + 4;
		// Command document and item array, before any item is added:
		// len + base elements + array element header + array len + two terminators.
		let empty_doc_len = 4 + base_elements.len() + 1 + array_key.len() + 1 + 4 + 1 + 1;

		let total = self.command.len();
		let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
		let mut doc_len = empty_doc_len;
		let mut split = false;
		for i in 0..total {
			let item = encode_document(&self.command.item_document(i), settings.max_document_size)?;
			let key = i.to_string();
			let entry_len = 1 + key.len() + 1 + item.len();
			// The first item always goes; otherwise stop at any advertised limit.
			if i > 0
				&& (i >= settings.max_batch_count as usize
					|| doc_len + entry_len > settings.max_document_size as usize + COMMAND_HEADROOM
					|| preamble + doc_len + entry_len > settings.max_message_size as usize)
			{
				split = true;
				break;
			}
			doc_len += entry_len;
			entries.push((key, item));
		}

		let covered = entries.len();
		let array_len: usize = 4 + entries.iter().map(|(k, v)| 1 + k.len() + 1 + v.len()).sum::<usize>() + 1;

		let start = start_frame(buf, self.request_id, OpCode::Query);
		buf.put_i32_le(0);
		put_cstring(buf, &format!("{}.$cmd", self.database));
		buf.put_i32_le(0);
		buf.put_i32_le(-1);
		buf.put_i32_le(doc_len as i32);
		buf.put_slice(base_elements);
		buf.put_u8(0x04);
		put_cstring(buf, array_key);
		buf.put_i32_le(array_len as i32);
		for (key, item) in &entries {
			buf.put_u8(0x03);
			put_cstring(buf, key);
			buf.put_slice(item);
		}
		buf.put_u8(0);
		buf.put_u8(0);
		finish_frame(buf, start, settings)?;

		let continuation = if split {
			let remainder = self.command.split_off(covered);
			Some(WriteCommandMessage {
				request_id: next_request_id(),
				database: self.database,
				collection: self.collection,
				ordered: self.ordered,
				write_concern: self.write_concern,
				command: remainder,
				offset: self.offset + covered,
			})
		} else {
			None
		};

		Ok(EncodedBatch {
			request_id: self.request_id,
			range_start: self.offset,
			item_count: covered,
			continuation,
		})
	}
}

#[cfg(test)]
#[path = "command_tests.rs"]
mod tests;
