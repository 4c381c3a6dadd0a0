use std::sync::Arc;

use rmongo_core::buf::BufferPool;
use tokio::runtime::Handle;

use crate::debug::{ConnectionDebugger, DebuggerMode, DebugStream};
use crate::error::Result;
use crate::settings::{DebugSettings, SocketSettings, TlsSettings};
use crate::transport::stream::AsyncStream;
use crate::transport::sync::RuntimeGroup;
use crate::transport::{
	DnsResolver, OperationContext, Resolver, ServerAddress, Stream, StreamFactory, tls,
};

/// Builds tokio-backed streams from socket and TLS settings. The buffer pool
/// and the I/O runtime are shared by every stream the factory creates; if the
/// factory created the runtime, dropping the factory shuts it down.
pub struct AsyncStreamFactory {
	socket: SocketSettings,
	tls_config: Option<Arc<rustls::ClientConfig>>,
	pool: BufferPool,
	runtime: RuntimeGroup,
	resolver: Arc<dyn Resolver>,
}

impl AsyncStreamFactory {
	pub fn new(
		socket: SocketSettings,
		tls: &TlsSettings,
		runtime: RuntimeGroup,
	) -> Result<Self> {
		let tls_config = if tls.enabled {
			Some(tls::client_config(tls)?)
		} else {
			None
		};
		Ok(Self {
			socket,
			tls_config,
			pool: BufferPool::new(),
			runtime,
			resolver: Arc::new(DnsResolver),
		})
	}

	/// Swaps the resolver seam, e.g. for tests or an external DNS stack.
	pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
		self.resolver = resolver;
		self
	}

	pub fn pool(&self) -> &BufferPool {
		&self.pool
	}

	pub fn handle(&self) -> Handle {
		self.runtime.handle()
	}

	/// The per-operation context streams from this factory should be driven
	/// with, carrying the configured timeouts.
	pub fn operation_context(&self) -> OperationContext {
		OperationContext::from_settings(&self.socket)
	}
}

impl StreamFactory for AsyncStreamFactory {
	fn create(&self, address: ServerAddress) -> Arc<dyn Stream> {
		Arc::new(AsyncStream::new(
			address,
			self.socket.clone(),
			self.tls_config.clone(),
			self.pool.clone(),
			self.resolver.clone(),
		))
	}
}

/// Wraps a factory so every produced stream is interposed by the debugger.
/// With mode Off the wrapping is a true no-op: the inner stream is returned
/// untouched and no debugger state exists.
pub struct DebugStreamFactory<F> {
	inner: F,
	settings: DebugSettings,
}

impl<F> DebugStreamFactory<F> {
	pub fn new(inner: F, settings: DebugSettings) -> Result<Self> {
		settings.validate()?;
		Ok(Self { inner, settings })
	}
}

impl<F: StreamFactory> StreamFactory for DebugStreamFactory<F> {
	fn create(&self, address: ServerAddress) -> Arc<dyn Stream> {
		let stream = self.inner.create(address);
		if self.settings.mode == DebuggerMode::Off {
			return stream;
		}
		Arc::new(DebugStream::new(
			stream,
			ConnectionDebugger::new(&self.settings),
		))
	}
}
