use bson::Document;
use bytes::Buf;

use crate::WireError;
use crate::header::{MessageHeader, ReplyHeader};

/// Seam for turning raw BSON bytes into documents. The engine supplies one of
/// these per conversation; the default goes through the bson crate.
pub trait DocumentDecoder {
	type Document;

	fn decode(&self, bytes: &[u8]) -> Result<Self::Document, WireError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BsonDecoder;

impl DocumentDecoder for BsonDecoder {
	type Document = Document;

	fn decode(&self, mut bytes: &[u8]) -> Result<Document, WireError> {
		Ok(Document::from_reader(&mut bytes)?)
	}
}

/// A fully decoded reply: wire header, reply fields, and the returned documents.
#[derive(Debug)]
pub struct Reply<D> {
	pub header: MessageHeader,
	pub fields: ReplyHeader,
	pub documents: Vec<D>,
}

impl<D> Reply<D> {
	/// Decodes the reply body that follows a validated message header. The
	/// header's `response_to` must match the request id the caller is awaiting.
	pub fn decode_body<B: Buf, C: DocumentDecoder<Document = D>>(
		header: MessageHeader,
		body: &mut B,
		awaiting_request_id: i32,
		decoder: &C,
	) -> Result<Self, WireError> {
		if header.response_to != awaiting_request_id {
			return Err(WireError::InvalidReply {
				expected: awaiting_request_id,
				actual: header.response_to,
			});
		}
		let fields = ReplyHeader::decode(body)?;
		let documents = decode_documents(&fields, body, decoder)?;
		Ok(Self {
			header,
			fields,
			documents,
		})
	}
}

/// Decodes the `number_returned` documents that follow a reply header.
pub fn decode_documents<B: Buf, C: DocumentDecoder>(
	fields: &ReplyHeader,
	body: &mut B,
	decoder: &C,
) -> Result<Vec<C::Document>, WireError> {
	let mut documents = Vec::with_capacity(fields.number_returned as usize);
	for _ in 0..fields.number_returned {
		let bytes = read_document_bytes(body)?;
		documents.push(decoder.decode(&bytes)?);
	}
	Ok(documents)
}

/// Copies one length-prefixed document out of the (possibly non-contiguous)
/// body, length prefix included.
fn read_document_bytes(body: &mut impl Buf) -> Result<Vec<u8>, WireError> {
	if body.remaining() < 4 {
		return Err(WireError::InvalidReplyHeader {
			reason: format!("truncated document: {} bytes remaining", body.remaining()),
		});
	}
	let len = body.get_i32_le();
	if len < 5 || (len as usize - 4) > body.remaining() {
		return Err(WireError::InvalidReplyHeader {
			reason: format!("document length {len} does not fit the reply body"),
		});
	}
	let mut out = Vec::with_capacity(len as usize);
	out.extend_from_slice(&len.to_le_bytes());
	out.resize(len as usize, 0);
	body.copy_to_slice(&mut out[4..]);
	Ok(out)
}

#[cfg(test)]
#[path = "reply_tests.rs"]
mod tests;
