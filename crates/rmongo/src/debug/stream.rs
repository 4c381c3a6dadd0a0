use async_trait::async_trait;
use rmongo_core::buf::{ByteBuf, CompositeBuf};

use crate::debug::{ConnectionDebugger, EventType, OperationCode, OperationMode, Verdict};
use crate::error::Result;
use crate::transport::{OperationContext, ServerAddress, Stream};

/// Interposes the debugger at every stream boundary: BEGIN before the inner
/// operation, END_SUCCESS/END_FAILURE after, I/O counters on the way. With
/// the debugger off every method is a plain delegation.
pub struct DebugStream<S> {
	inner: S,
	debugger: ConnectionDebugger,
}

impl<S> DebugStream<S> {
	pub fn new(inner: S, debugger: ConnectionDebugger) -> Self {
		Self { inner, debugger }
	}

	pub fn debugger(&self) -> &ConnectionDebugger {
		&self.debugger
	}
}

#[async_trait]
impl<S: Stream> Stream for DebugStream<S> {
	async fn open(&self, ctx: &OperationContext) -> Result<()> {
		let Some(d) = self.debugger.enabled() else {
			return self.inner.open(ctx).await;
		};
		d.record_stream_op(ctx.mode, OperationCode::Open, EventType::Begin, Vec::new())
			.into_result()?;
		match self.inner.open(ctx).await {
			Ok(()) => {
				d.record_stream_op(ctx.mode, OperationCode::Open, EventType::EndSuccess, Vec::new())
					.into_result()?;
				Ok(())
			},
			Err(e) => {
				d.record_stream_op(
					ctx.mode,
					OperationCode::Open,
					EventType::EndFailure,
					vec![e.to_string()],
				)
				.into_result()?;
				Err(e)
			},
		}
	}

	async fn read(&self, count: i32, ctx: &OperationContext) -> Result<CompositeBuf> {
		let Some(d) = self.debugger.enabled() else {
			return self.inner.read(count, ctx).await;
		};
		d.record_stream_op(
			ctx.mode,
			OperationCode::Read,
			EventType::Begin,
			vec![format!("numberOfBytes={count}")],
		)
		.into_result()?;

		match self.inner.read(count, ctx).await {
			Ok(buf) => {
				// Exactly one increment per successful read.
				d.io().succeeded_read(buf.remaining() as i64);
				if let Verdict::Abort(e) = d.record_stream_op(
					ctx.mode,
					OperationCode::Read,
					EventType::EndSuccess,
					Vec::new(),
				) {
					// The caller will never see the buffer; release it here.
					buf.release();
					return Err(e.into());
				}
				Ok(buf)
			},
			Err(e) => {
				if let Some(diagnostic) = d.failed_read(count as i64) {
					if let Verdict::Abort(raised) = d.report(diagnostic) {
						return Err(raised.into());
					}
				}
				d.record_stream_op(
					ctx.mode,
					OperationCode::Read,
					EventType::EndFailure,
					vec![e.to_string()],
				)
				.into_result()?;
				Err(e)
			},
		}
	}

	async fn write(&self, buffers: &[ByteBuf], ctx: &OperationContext) -> Result<()> {
		let Some(d) = self.debugger.enabled() else {
			return self.inner.write(buffers, ctx).await;
		};
		let total: usize = buffers.iter().map(|b| b.remaining()).sum();
		d.record_stream_op(
			ctx.mode,
			OperationCode::Write,
			EventType::Begin,
			vec![format!("numberOfBytes={total}")],
		)
		.into_result()?;
		match self.inner.write(buffers, ctx).await {
			Ok(()) => {
				d.io().succeeded_write();
				d.record_stream_op(ctx.mode, OperationCode::Write, EventType::EndSuccess, Vec::new())
					.into_result()?;
				Ok(())
			},
			Err(e) => {
				d.io().failed_write();
				d.record_stream_op(
					ctx.mode,
					OperationCode::Write,
					EventType::EndFailure,
					vec![e.to_string()],
				)
				.into_result()?;
				Err(e)
			},
		}
	}

	fn close(&self) {
		// Close may interleave with anything and has no operation context, so
		// it records with the Unknown mode and never aborts.
		if let Some(d) = self.debugger.enabled() {
			let _ = d.record_stream_op(
				OperationMode::Unknown,
				OperationCode::Close,
				EventType::Begin,
				Vec::new(),
			);
		}
		self.inner.close();
		if let Some(d) = self.debugger.enabled() {
			let _ = d.record_stream_op(
				OperationMode::Unknown,
				OperationCode::Close,
				EventType::EndSuccess,
				Vec::new(),
			);
		}
	}

	fn address(&self) -> &ServerAddress {
		self.inner.address()
	}

	fn is_closed(&self) -> bool {
		self.inner.is_closed()
	}

	fn get_buffer(&self, size: usize) -> ByteBuf {
		self.inner.get_buffer(size)
	}
}

#[cfg(test)]
#[path = "stream_tests.rs"]
mod tests;
