use std::future::Future;
use std::sync::Arc;
use std::sync::mpsc;

use rmongo_core::buf::{ByteBuf, CompositeBuf};
use tokio::runtime::{Handle, Runtime};

use crate::error::{Error, Result};
use crate::transport::{OperationContext, ServerAddress, Stream};

/// The I/O runtime a stream factory drives its connections on. A factory that
/// creates the runtime owns it and shuts it down when dropped; a factory
/// handed a shared handle must leave the runtime alone.
pub enum RuntimeGroup {
	Owned(Runtime),
	Shared(Handle),
}

impl RuntimeGroup {
	pub fn owned() -> std::io::Result<RuntimeGroup> {
		Ok(RuntimeGroup::Owned(
			tokio::runtime::Builder::new_multi_thread()
				.enable_all()
				.thread_name("rmongo-io")
				.build()?,
		))
	}

	pub fn shared(handle: Handle) -> RuntimeGroup {
		RuntimeGroup::Shared(handle)
	}

	pub fn handle(&self) -> Handle {
		match self {
			RuntimeGroup::Owned(runtime) => runtime.handle().clone(),
			RuntimeGroup::Shared(handle) => handle.clone(),
		}
	}
}

/// Runs the async form on the runtime and parks the calling thread on a latch
/// until it completes. If the latch is torn down before a completion arrives
/// (runtime shutdown, task abort), the waiter gets a typed Interrupted error,
/// never a silent wakeup.
pub(crate) fn wait<T, F>(handle: &Handle, future: F) -> Result<T>
where
	T: Send + 'static,
	F: Future<Output = Result<T>> + Send + 'static,
{
	let (tx, rx) = mpsc::sync_channel(1);
	handle.spawn(async move {
		let _ = tx.send(future.await);
	});
	rx.recv().map_err(|_| Error::Interrupted)?
}

/// Blocking adapter over a stream. Every call drives the stream's async state
/// machine; there is no parallel synchronous implementation. Operations
/// entered here record the Sync mode in the debugger.
pub struct SyncStream {
	stream: Arc<dyn Stream>,
	handle: Handle,
}

impl SyncStream {
	pub fn new(stream: Arc<dyn Stream>, handle: Handle) -> Self {
		Self { stream, handle }
	}

	pub fn open(&self, ctx: &OperationContext) -> Result<()> {
		let stream = self.stream.clone();
		let ctx = ctx.clone().blocking();
		wait(&self.handle, async move { stream.open(&ctx).await })
	}

	pub fn read(&self, count: i32, ctx: &OperationContext) -> Result<CompositeBuf> {
		let stream = self.stream.clone();
		let ctx = ctx.clone().blocking();
		wait(&self.handle, async move { stream.read(count, &ctx).await })
	}

	pub fn write(&self, buffers: &[ByteBuf], ctx: &OperationContext) -> Result<()> {
		// The caller keeps its buffers; the latch task works on retained views.
		let views: Vec<ByteBuf> = buffers.iter().map(|b| b.duplicate()).collect();
		let stream = self.stream.clone();
		let ctx = ctx.clone().blocking();
		wait(&self.handle, async move {
			let result = stream.write(&views, &ctx).await;
			for view in views {
				view.release();
			}
			result
		})
	}

	pub fn close(&self) {
		self.stream.close();
	}

	pub fn address(&self) -> &ServerAddress {
		self.stream.address()
	}

	pub fn is_closed(&self) -> bool {
		self.stream.is_closed()
	}

	pub fn get_buffer(&self, size: usize) -> ByteBuf {
		self.stream.get_buffer(size)
	}
}
