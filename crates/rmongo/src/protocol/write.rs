use bson::{Bson, Document, doc};
use rmongo_wire::{BsonDecoder, DeleteMessage, InsertMessage, UpdateMessage};
use tokio::runtime::Handle;
use tracing::debug;

use crate::error::{Result, command_failure, error_code, reply_ok, write_failure};
use crate::protocol::{Connection, Namespace, check_reply_flags, single_document};
use crate::transport::OperationContext;
use crate::transport::sync;

/// Server-side acknowledgment policy for legacy writes. `w == 0` means
/// unacknowledged: fire-and-forget, no follow-up sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteConcern {
	pub w: i32,
	pub wtimeout_ms: u64,
	pub journal: bool,
}

impl WriteConcern {
	pub const ACKNOWLEDGED: WriteConcern = WriteConcern {
		w: 1,
		wtimeout_ms: 0,
		journal: false,
	};
	pub const UNACKNOWLEDGED: WriteConcern = WriteConcern {
		w: 0,
		wtimeout_ms: 0,
		journal: false,
	};

	pub fn acknowledged(&self) -> bool {
		self.w != 0
	}

	fn get_last_error_command(&self) -> Document {
		let mut cmd = doc! { "getlasterror": 1 };
		if self.w > 1 {
			cmd.insert("w", self.w);
		}
		if self.wtimeout_ms > 0 {
			cmd.insert("wtimeout", self.wtimeout_ms as i64);
		}
		if self.journal {
			cmd.insert("j", true);
		}
		cmd
	}

	/// The command-message form, for the write-command path.
	pub fn to_document(&self) -> Document {
		let mut wc = doc! { "w": self.w };
		if self.wtimeout_ms > 0 {
			wc.insert("wtimeout", self.wtimeout_ms as i64);
		}
		if self.journal {
			wc.insert("j", true);
		}
		wc
	}
}

/// Result of a legacy write. For unacknowledged writes nothing is known
/// beyond the fact that the message was sent.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteConcernResult {
	pub acknowledged: bool,
	pub count: i32,
	pub updated_existing: bool,
	pub upserted_id: Option<Bson>,
}

impl WriteConcernResult {
	fn unacknowledged() -> Self {
		Self {
			acknowledged: false,
			count: 0,
			updated_existing: false,
			upserted_id: None,
		}
	}
}

impl Connection {
	/// Legacy insert: OP_INSERT, then a get-last-error round trip when the
	/// write concern is acknowledged.
	pub async fn execute_insert(
		&self,
		namespace: &Namespace,
		documents: Vec<Document>,
		write_concern: &WriteConcern,
		ctx: &OperationContext,
	) -> Result<WriteConcernResult> {
		let message = InsertMessage::new(namespace.full_name(), documents);
		let settings = *self.message_settings();
		self.send_message(ctx, |buf| Ok(message.encode(buf, &settings)?))
			.await?;
		self.write_result(namespace, write_concern, ctx).await
	}

	/// Legacy update: OP_UPDATE (+ optional upsert/multi flags) then GLE.
	#[allow(clippy::too_many_arguments)]
	pub async fn execute_update(
		&self,
		namespace: &Namespace,
		filter: Document,
		update: Document,
		upsert: bool,
		multi: bool,
		write_concern: &WriteConcern,
		ctx: &OperationContext,
	) -> Result<WriteConcernResult> {
		let mut message = UpdateMessage::new(namespace.full_name(), filter, update);
		message.upsert = upsert;
		message.multi = multi;
		let settings = *self.message_settings();
		self.send_message(ctx, |buf| Ok(message.encode(buf, &settings)?))
			.await?;
		self.write_result(namespace, write_concern, ctx).await
	}

	/// Legacy delete: OP_DELETE then GLE.
	pub async fn execute_delete(
		&self,
		namespace: &Namespace,
		filter: Document,
		single_remove: bool,
		write_concern: &WriteConcern,
		ctx: &OperationContext,
	) -> Result<WriteConcernResult> {
		let mut message = DeleteMessage::new(namespace.full_name(), filter);
		message.single_remove = single_remove;
		let settings = *self.message_settings();
		self.send_message(ctx, |buf| Ok(message.encode(buf, &settings)?))
			.await?;
		self.write_result(namespace, write_concern, ctx).await
	}

	/// The authoritative result of an acknowledged legacy write is the reply
	/// to the get-last-error command that follows it on the same connection.
	async fn write_result(
		&self,
		namespace: &Namespace,
		write_concern: &WriteConcern,
		ctx: &OperationContext,
	) -> Result<WriteConcernResult> {
		if !write_concern.acknowledged() {
			debug!(namespace = %namespace, "unacknowledged write sent");
			return Ok(WriteConcernResult::unacknowledged());
		}
		let gle = rmongo_wire::CommandMessage::new(
			&namespace.database,
			write_concern.get_last_error_command(),
		);
		let request_id = gle.request_id();
		let settings = *self.message_settings();
		self.send_message(ctx, |buf| Ok(gle.encode(buf, &settings)?))
			.await?;
		let reply = self.receive_reply(request_id, &BsonDecoder, ctx).await?;
		check_reply_flags(&reply, 0)?;
		let document = single_document(reply)?;
		if !reply_ok(&document) {
			return Err(command_failure(document));
		}
		// An ok GLE reply can still report a write error through `err`.
		if let Some(Bson::String(err)) = document.get("err") {
			return Err(write_failure(error_code(&document), err.clone()));
		}
		Ok(WriteConcernResult {
			acknowledged: true,
			count: match document.get("n") {
				Some(Bson::Int32(n)) => *n,
				Some(Bson::Int64(n)) => *n as i32,
				Some(Bson::Double(n)) => *n as i32,
				_ => 0,
			},
			updated_existing: matches!(document.get("updatedExisting"), Some(Bson::Boolean(true))),
			upserted_id: document.get("upserted").cloned(),
		})
	}

	pub fn execute_insert_blocking(
		&self,
		handle: &Handle,
		namespace: &Namespace,
		documents: Vec<Document>,
		write_concern: &WriteConcern,
		ctx: &OperationContext,
	) -> Result<WriteConcernResult> {
		let conn = self.clone();
		let namespace = namespace.clone();
		let write_concern = write_concern.clone();
		let ctx = ctx.clone().blocking();
		sync::wait(handle, async move {
			conn.execute_insert(&namespace, documents, &write_concern, &ctx)
				.await
		})
	}

	#[allow(clippy::too_many_arguments)]
	pub fn execute_update_blocking(
		&self,
		handle: &Handle,
		namespace: &Namespace,
		filter: Document,
		update: Document,
		upsert: bool,
		multi: bool,
		write_concern: &WriteConcern,
		ctx: &OperationContext,
	) -> Result<WriteConcernResult> {
		let conn = self.clone();
		let namespace = namespace.clone();
		let write_concern = write_concern.clone();
		let ctx = ctx.clone().blocking();
		sync::wait(handle, async move {
			conn.execute_update(&namespace, filter, update, upsert, multi, &write_concern, &ctx)
				.await
		})
	}

	pub fn execute_delete_blocking(
		&self,
		handle: &Handle,
		namespace: &Namespace,
		filter: Document,
		single_remove: bool,
		write_concern: &WriteConcern,
		ctx: &OperationContext,
	) -> Result<WriteConcernResult> {
		let conn = self.clone();
		let namespace = namespace.clone();
		let write_concern = write_concern.clone();
		let ctx = ctx.clone().blocking();
		sync::wait(handle, async move {
			conn.execute_delete(&namespace, filter, single_remove, &write_concern, &ctx)
				.await
		})
	}
}

#[cfg(test)]
#[path = "write_tests.rs"]
mod tests;
