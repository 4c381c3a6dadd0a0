use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use bson::Document;
use bytes::Bytes;
use rmongo_core::buf::{BufferPool, ByteBuf, CompositeBuf};
use rmongo_wire::header::{HEADER_LEN, MessageHeader, OpCode, ReplyHeader};

use crate::error::{Error, Result};
use crate::transport::{OperationContext, ServerAddress, Stream};

/// A reply the mock will materialize once the request it answers has been
/// written, so its `response_to` can be correlated like a real server would.
pub(crate) struct MockReply {
	pub documents: Vec<Document>,
	pub response_flags: i32,
	pub cursor_id: i64,
	pub op_code: i32,
	/// Overrides the correlation id; defaults to the last written request id.
	pub response_to: Option<i32>,
}

impl MockReply {
	pub fn ok(documents: Vec<Document>) -> Self {
		Self {
			documents,
			response_flags: 0,
			cursor_id: 0,
			op_code: OpCode::Reply as i32,
			response_to: None,
		}
	}
}

struct MockState {
	written_messages: Vec<Vec<u8>>,
	inbound: VecDeque<u8>,
	replies: VecDeque<MockReply>,
	closed: bool,
	hang_reads: bool,
}

/// Scripted in-memory stream for engine and debugger tests. Writes are
/// captured message-by-message; reads serve bytes from raw preloads and from
/// scripted replies correlated against the last written message.
pub(crate) struct MockStream {
	address: ServerAddress,
	pool: BufferPool,
	state: Mutex<MockState>,
}

impl MockStream {
	pub fn new() -> Self {
		Self {
			address: ServerAddress::new("mock", 27017),
			pool: BufferPool::new(),
			state: Mutex::new(MockState {
				written_messages: Vec::new(),
				inbound: VecDeque::new(),
				replies: VecDeque::new(),
				closed: false,
				hang_reads: false,
			}),
		}
	}

	/// A stream whose reads never complete; for pending-reader scenarios.
	pub fn hanging() -> Self {
		let stream = Self::new();
		stream.state.lock().unwrap().hang_reads = true;
		stream
	}

	pub fn pool(&self) -> &BufferPool {
		&self.pool
	}

	pub fn enqueue_reply(&self, reply: MockReply) {
		self.state.lock().unwrap().replies.push_back(reply);
	}

	pub fn enqueue_raw(&self, bytes: &[u8]) {
		self.state.lock().unwrap().inbound.extend(bytes.iter().copied());
	}

	pub fn written_messages(&self) -> Vec<Vec<u8>> {
		self.state.lock().unwrap().written_messages.clone()
	}

	fn materialize_replies(state: &mut MockState, needed: usize) {
		while state.inbound.len() < needed {
			let Some(reply) = state.replies.pop_front() else {
				break;
			};
			let response_to = reply.response_to.unwrap_or_else(|| {
				state
					.written_messages
					.last()
					.map(|m| request_id_of(m))
					.unwrap_or(0)
			});
			let mut body = Vec::new();
			for doc in &reply.documents {
				doc.to_writer(&mut body).unwrap();
			}
			let total = HEADER_LEN + 20 + body.len();
			let mut buf = ByteBuf::with_capacity(total);
			MessageHeader {
				message_length: total as i32,
				request_id: 900,
				response_to,
				op_code: reply.op_code,
			}
			.encode(&mut buf);
			ReplyHeader {
				response_flags: reply.response_flags,
				cursor_id: reply.cursor_id,
				starting_from: 0,
				number_returned: reply.documents.len() as i32,
			}
			.encode(&mut buf);
			buf.put_slice(&body);
			buf.flip();
			state.inbound.extend(buf.readable().iter().copied());
		}
	}
}

pub(crate) fn request_id_of(message: &[u8]) -> i32 {
	i32::from_le_bytes(message[4..8].try_into().unwrap())
}

#[async_trait]
impl Stream for MockStream {
	async fn open(&self, _ctx: &OperationContext) -> Result<()> {
		Ok(())
	}

	async fn read(&self, count: i32, _ctx: &OperationContext) -> Result<CompositeBuf> {
		if count < 0 {
			return Err(Error::NegativeRead { requested: count });
		}
		let hang = self.state.lock().unwrap().hang_reads;
		if hang {
			futures::future::pending::<()>().await;
		}
		let mut state = self.state.lock().unwrap();
		if state.closed {
			return Err(Error::socket(self.address.to_string(), "stream is closed"));
		}
		let count = count as usize;
		Self::materialize_replies(&mut state, count);
		if state.inbound.len() < count {
			return Err(Error::socket(
				self.address.to_string(),
				format!(
					"scripted stream exhausted: wanted {count}, have {}",
					state.inbound.len()
				),
			));
		}
		let bytes: Vec<u8> = state.inbound.drain(..count).collect();
		let buf = self.pool.wrap_inbound(Bytes::from(bytes));
		Ok(CompositeBuf::new(vec![buf]))
	}

	async fn write(&self, buffers: &[ByteBuf], _ctx: &OperationContext) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		if state.closed {
			return Err(Error::socket(self.address.to_string(), "stream is closed"));
		}
		let mut message = Vec::new();
		for buf in buffers {
			message.extend_from_slice(buf.readable());
		}
		state.written_messages.push(message);
		Ok(())
	}

	fn close(&self) {
		self.state.lock().unwrap().closed = true;
	}

	fn address(&self) -> &ServerAddress {
		&self.address
	}

	fn is_closed(&self) -> bool {
		self.state.lock().unwrap().closed
	}

	fn get_buffer(&self, size: usize) -> ByteBuf {
		self.pool.get_buffer(size)
	}
}
