use bson::Document;
use rmongo_wire::{BsonDecoder, GetMoreMessage, KillCursorsMessage, Reply};
use tokio::runtime::Handle;
use tracing::debug;

use crate::error::Result;
use crate::protocol::{Connection, Namespace, check_reply_flags};
use crate::transport::OperationContext;
use crate::transport::sync;

impl Connection {
	/// Fetches the next batch of an open server cursor. A cursor-not-found
	/// flag surfaces as a typed error carrying the requested cursor id.
	pub async fn execute_get_more(
		&self,
		namespace: &Namespace,
		cursor_id: i64,
		number_to_return: i32,
		ctx: &OperationContext,
	) -> Result<Reply<Document>> {
		let message = GetMoreMessage::new(namespace.full_name(), cursor_id, number_to_return);
		let request_id = message.request_id();
		let settings = *self.message_settings();
		self.send_message(ctx, |buf| Ok(message.encode(buf, &settings)?))
			.await?;
		let reply = self.receive_reply(request_id, &BsonDecoder, ctx).await?;
		check_reply_flags(&reply, cursor_id)?;
		Ok(reply)
	}

	/// Fire-and-forget cursor kill; the server sends no reply.
	pub async fn kill_cursors(&self, cursor_ids: Vec<i64>, ctx: &OperationContext) -> Result<()> {
		debug!(count = cursor_ids.len(), "killing cursors");
		let message = KillCursorsMessage::new(cursor_ids);
		let settings = *self.message_settings();
		self.send_message(ctx, |buf| Ok(message.encode(buf, &settings)?))
			.await
	}

	/// Drains the replies an exhaust-style conversation still owes after a
	/// client-side cursor close: keep receiving until the server reports a
	/// dead cursor, following each reply's request id to the next.
	pub async fn discard_get_more_replies(
		&self,
		initial_request_id: i32,
		ctx: &OperationContext,
	) -> Result<()> {
		let mut awaiting = initial_request_id;
		loop {
			let reply: Reply<Document> = self.receive_reply(awaiting, &BsonDecoder, ctx).await?;
			if reply.fields.cursor_id == 0 {
				return Ok(());
			}
			awaiting = reply.header.request_id;
		}
	}

	pub fn execute_get_more_blocking(
		&self,
		handle: &Handle,
		namespace: &Namespace,
		cursor_id: i64,
		number_to_return: i32,
		ctx: &OperationContext,
	) -> Result<Reply<Document>> {
		let conn = self.clone();
		let namespace = namespace.clone();
		let ctx = ctx.clone().blocking();
		sync::wait(handle, async move {
			conn.execute_get_more(&namespace, cursor_id, number_to_return, &ctx)
				.await
		})
	}

	pub fn kill_cursors_blocking(
		&self,
		handle: &Handle,
		cursor_ids: Vec<i64>,
		ctx: &OperationContext,
	) -> Result<()> {
		let conn = self.clone();
		let ctx = ctx.clone().blocking();
		sync::wait(handle, async move { conn.kill_cursors(cursor_ids, &ctx).await })
	}
}

#[cfg(test)]
#[path = "cursor_tests.rs"]
mod tests;
