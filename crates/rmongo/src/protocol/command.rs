use bson::Document;
use rmongo_wire::{BsonDecoder, CommandMessage, QueryMessage, Reply};
use tokio::runtime::Handle;
use tracing::debug;

use crate::debug::{EventType, OperationCode};
use crate::error::{Result, command_failure, reply_ok};
use crate::protocol::{Connection, Namespace, check_reply_flags, single_document};
use crate::transport::OperationContext;
use crate::transport::sync;

impl Connection {
	/// Runs a command and returns its reply document. A reply with a falsy
	/// `ok` is classified into the error taxonomy (execution timeout, command
	/// failure) with the server's document attached.
	pub async fn run_command(
		&self,
		database: &str,
		command: Document,
		ctx: &OperationContext,
	) -> Result<Document> {
		if let Some(d) = self.debugger.enabled() {
			d.record_connection_op(
				ctx.mode,
				OperationCode::Command,
				EventType::Begin,
				vec![format!("database={database}")],
			);
		}
		let result = self.run_command_inner(database, command, ctx).await;
		if let Some(d) = self.debugger.enabled() {
			match &result {
				Ok(_) => d.record_connection_op(
					ctx.mode,
					OperationCode::Command,
					EventType::EndSuccess,
					Vec::new(),
				),
				Err(e) => d.record_connection_op(
					ctx.mode,
					OperationCode::Command,
					EventType::EndFailure,
					vec![e.to_string()],
				),
			}
		}
		debug!(database, ok = result.is_ok(), "command completed");
		result
	}

	async fn run_command_inner(
		&self,
		database: &str,
		command: Document,
		ctx: &OperationContext,
	) -> Result<Document> {
		let message = CommandMessage::new(database, command);
		let request_id = message.request_id();
		let settings = *self.message_settings();
		self.send_message(ctx, |buf| Ok(message.encode(buf, &settings)?))
			.await?;

		let reply = self.receive_reply(request_id, &BsonDecoder, ctx).await?;
		check_reply_flags(&reply, 0)?;
		let document = single_document(reply)?;
		if !reply_ok(&document) {
			return Err(command_failure(document));
		}
		Ok(document)
	}

	/// Sends a query and returns the raw reply, classified for query-failure
	/// and cursor-not-found flags.
	pub async fn execute_query(
		&self,
		namespace: &Namespace,
		query: Document,
		number_to_return: i32,
		ctx: &OperationContext,
	) -> Result<Reply<Document>> {
		let mut message = QueryMessage::new(namespace.full_name(), query);
		message.number_to_return = number_to_return;
		let request_id = message.request_id();
		let settings = *self.message_settings();
		self.send_message(ctx, |buf| Ok(message.encode(buf, &settings)?))
			.await?;

		let reply = self.receive_reply(request_id, &BsonDecoder, ctx).await?;
		check_reply_flags(&reply, 0)?;
		Ok(reply)
	}

	/// Blocking form of [`Self::run_command`]; parks on the runtime latch.
	pub fn run_command_blocking(
		&self,
		handle: &Handle,
		database: &str,
		command: Document,
		ctx: &OperationContext,
	) -> Result<Document> {
		let conn = self.clone();
		let database = database.to_string();
		let ctx = ctx.clone().blocking();
		sync::wait(handle, async move {
			conn.run_command(&database, command, &ctx).await
		})
	}

	/// Blocking form of [`Self::execute_query`].
	pub fn execute_query_blocking(
		&self,
		handle: &Handle,
		namespace: &Namespace,
		query: Document,
		number_to_return: i32,
		ctx: &OperationContext,
	) -> Result<Reply<Document>> {
		let conn = self.clone();
		let namespace = namespace.clone();
		let ctx = ctx.clone().blocking();
		sync::wait(handle, async move {
			conn.execute_query(&namespace, query, number_to_return, &ctx)
				.await
		})
	}
}

#[cfg(test)]
#[path = "command_tests.rs"]
mod tests;
