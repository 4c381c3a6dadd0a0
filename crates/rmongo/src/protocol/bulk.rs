use bson::{Bson, Document};
use rmongo_wire::command::{WriteCommand, WriteCommandMessage};
use rmongo_wire::BsonDecoder;
use tokio::runtime::Handle;
use tracing::debug;

use crate::error::{Error, Result, command_failure, reply_ok};
use crate::protocol::write::WriteConcern;
use crate::protocol::{Connection, Namespace, single_document};
use crate::transport::OperationContext;
use crate::transport::sync;

/// Translates physical item indices inside one batched reply back to logical
/// indices in the caller's original list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexMap {
	range_start: usize,
	count: usize,
}

impl IndexMap {
	pub fn new(range_start: usize, count: usize) -> Self {
		Self { range_start, count }
	}

	pub fn map(&self, physical: usize) -> usize {
		debug_assert!(physical < self.count, "physical index outside the batch");
		self.range_start + physical
	}

	pub fn count(&self) -> usize {
		self.count
	}
}

/// One write error inside a bulk operation, indexed against the caller's
/// original item list.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkWriteFailure {
	pub index: usize,
	pub code: i32,
	pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkWriteResult {
	pub inserted_count: i64,
	pub matched_count: i64,
	pub modified_count: i64,
	pub deleted_count: i64,
	/// (logical index, upserted id) pairs.
	pub upserts: Vec<(usize, Bson)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchKind {
	Insert,
	Update,
	Delete,
}

impl BatchKind {
	fn of(command: &WriteCommand) -> Self {
		match command {
			WriteCommand::Insert(_) => BatchKind::Insert,
			WriteCommand::Update(_) => BatchKind::Update,
			WriteCommand::Delete(_) => BatchKind::Delete,
		}
	}
}

/// Merges per-batch replies into one aggregated outcome. For ordered bulk
/// writes the first error stops further batches.
pub struct BulkWriteBatchCombiner {
	ordered: bool,
	result: BulkWriteResult,
	failures: Vec<BulkWriteFailure>,
	write_concern_error: Option<Document>,
}

impl BulkWriteBatchCombiner {
	pub fn new(ordered: bool) -> Self {
		Self {
			ordered,
			result: BulkWriteResult::default(),
			failures: Vec::new(),
			write_concern_error: None,
		}
	}

	fn add_response(&mut self, kind: BatchKind, response: &Document, map: &IndexMap) {
		let n = int64_field(response, "n");
		match kind {
			BatchKind::Insert => self.result.inserted_count += n,
			BatchKind::Delete => self.result.deleted_count += n,
			BatchKind::Update => {
				let mut upserted_here = 0i64;
				if let Some(Bson::Array(items)) = response.get("upserted") {
					for item in items {
						if let Bson::Document(d) = item {
							let physical = int64_field(d, "index") as usize;
							if let Some(id) = d.get("_id") {
								self.result.upserts.push((map.map(physical), id.clone()));
								upserted_here += 1;
							}
						}
					}
				}
				self.result.matched_count += (n - upserted_here).max(0);
				self.result.modified_count += int64_field(response, "nModified");
			},
		}

		if let Some(Bson::Array(errors)) = response.get("writeErrors") {
			for error in errors {
				if let Bson::Document(e) = error {
					let physical = int64_field(e, "index") as usize;
					self.failures.push(BulkWriteFailure {
						index: map.map(physical),
						code: crate::error::error_code(e),
						message: crate::error::error_message(e),
					});
				}
			}
		}
		if let Some(Bson::Document(wce)) = response.get("writeConcernError") {
			self.write_concern_error = Some(wce.clone());
		}
	}

	/// Ordered bulk writes stop sending batches after the first error.
	pub fn should_stop(&self) -> bool {
		self.ordered && !self.failures.is_empty()
	}

	pub fn into_result(self) -> Result<BulkWriteResult> {
		if self.failures.is_empty() && self.write_concern_error.is_none() {
			Ok(self.result)
		} else {
			Err(Error::BulkWrite {
				failures: self.failures,
				write_concern_error: self.write_concern_error,
				partial: self.result,
			})
		}
	}
}

fn int64_field(doc: &Document, key: &str) -> i64 {
	match doc.get(key) {
		Some(Bson::Int32(v)) => *v as i64,
		Some(Bson::Int64(v)) => *v,
		Some(Bson::Double(v)) => *v as i64,
		_ => 0,
	}
}

impl Connection {
	/// Executes one logical bulk write, splitting into as many physical
	/// messages as the server limits demand. Batches go out strictly
	/// sequentially; each reply is merged under its index map before the next
	/// batch is sent.
	pub async fn execute_write_command(
		&self,
		namespace: &Namespace,
		command: WriteCommand,
		ordered: bool,
		write_concern: &WriteConcern,
		ctx: &OperationContext,
	) -> Result<BulkWriteResult> {
		let kind = BatchKind::of(&command);
		let mut combiner = BulkWriteBatchCombiner::new(ordered);
		let mut next = Some(WriteCommandMessage::new(
			&namespace.database,
			&namespace.collection,
			ordered,
			Some(write_concern.to_document()),
			command,
		));

		while let Some(message) = next.take() {
			let settings = *self.message_settings();
			let mut buf = self
				.stream()
				.get_buffer(settings.max_message_size as usize);
			let batch = match message.encode_into(&mut buf, &settings) {
				Ok(batch) => batch,
				Err(e) => {
					buf.release();
					return Err(e.into());
				},
			};
			buf.flip();
			let write_result = self.stream().write(std::slice::from_ref(&buf), ctx).await;
			buf.release();
			write_result?;

			let reply = self
				.receive_reply(batch.request_id, &BsonDecoder, ctx)
				.await?;
			let document = single_document(reply)?;
			if !reply_ok(&document) {
				return Err(command_failure(document));
			}

			let map = IndexMap::new(batch.range_start, batch.item_count);
			combiner.add_response(kind, &document, &map);
			debug!(
				request_id = batch.request_id,
				range_start = batch.range_start,
				items = batch.item_count,
				"bulk write batch completed"
			);
			if combiner.should_stop() {
				break;
			}
			next = batch.continuation;
		}
		combiner.into_result()
	}

	pub fn execute_write_command_blocking(
		&self,
		handle: &Handle,
		namespace: &Namespace,
		command: WriteCommand,
		ordered: bool,
		write_concern: &WriteConcern,
		ctx: &OperationContext,
	) -> Result<BulkWriteResult> {
		let conn = self.clone();
		let namespace = namespace.clone();
		let write_concern = write_concern.clone();
		let ctx = ctx.clone().blocking();
		sync::wait(handle, async move {
			conn.execute_write_command(&namespace, command, ordered, &write_concern, &ctx)
				.await
		})
	}
}

#[cfg(test)]
#[path = "bulk_tests.rs"]
mod tests;
