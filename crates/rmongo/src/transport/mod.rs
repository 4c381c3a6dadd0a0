pub mod factory;
pub mod stream;
pub mod sync;
pub mod tls;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use rmongo_core::buf::{ByteBuf, CompositeBuf};

use crate::debug::OperationMode;
use crate::error::{Error, Result};
use crate::settings::SocketSettings;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
	pub host: String,
	pub port: u16,
}

impl ServerAddress {
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		Self {
			host: host.into(),
			port,
		}
	}
}

impl fmt::Display for ServerAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

impl std::str::FromStr for ServerAddress {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		let (host, port) = s
			.rsplit_once(':')
			.ok_or_else(|| Error::Configuration(format!("address {s:?} is missing a port")))?;
		let port = port
			.parse()
			.map_err(|_| Error::Configuration(format!("address {s:?} has an invalid port")))?;
		Ok(Self::new(host, port))
	}
}

/// Resolves a server address into an ordered list of socket addresses to try.
/// DNS is an external collaborator; the default implementation defers to the
/// runtime's resolver.
#[async_trait]
pub trait Resolver: Send + Sync {
	async fn resolve(&self, address: &ServerAddress) -> Result<Vec<SocketAddr>>;
}

#[derive(Debug, Default)]
pub struct DnsResolver;

#[async_trait]
impl Resolver for DnsResolver {
	async fn resolve(&self, address: &ServerAddress) -> Result<Vec<SocketAddr>> {
		let addrs = tokio::net::lookup_host((address.host.as_str(), address.port))
			.await
			.map_err(|e| Error::SocketOpen {
				address: address.to_string(),
				source: Some(e),
			})?;
		Ok(addrs.collect())
	}
}

/// Per-operation timeouts and the invocation mode the operation was entered
/// through. A zero timeout means no timeout is scheduled.
#[derive(Debug, Clone)]
pub struct OperationContext {
	pub connect_timeout: Duration,
	pub read_timeout: Duration,
	pub write_timeout: Duration,
	pub mode: OperationMode,
}

impl Default for OperationContext {
	fn default() -> Self {
		Self {
			connect_timeout: Duration::ZERO,
			read_timeout: Duration::ZERO,
			write_timeout: Duration::ZERO,
			mode: OperationMode::Async,
		}
	}
}

impl OperationContext {
	pub fn from_settings(settings: &SocketSettings) -> Self {
		Self {
			connect_timeout: settings.connect_timeout(),
			read_timeout: settings.read_timeout(),
			write_timeout: settings.write_timeout(),
			mode: OperationMode::Async,
		}
	}

	/// Marks the operation as entered through a blocking adapter.
	pub fn blocking(mut self) -> Self {
		self.mode = OperationMode::Sync;
		self
	}
}

/// A connection-oriented byte stream to one server address.
///
/// The async forms are canonical; blocking forms live in [`sync`] and reuse
/// the same state machine. At most one read may be pending at a time: that is
/// a caller contract, checked by the debugger rather than enforced here.
#[async_trait]
pub trait Stream: Send + Sync {
	/// Establishes the connection: resolve, TCP connect (trying candidate
	/// addresses in order), optional TLS handshake.
	async fn open(&self, ctx: &OperationContext) -> Result<()>;

	/// Returns exactly `count` bytes, or fails. Zero is answered immediately
	/// with an empty buffer; a negative count is a caller logic error.
	async fn read(&self, count: i32, ctx: &OperationContext) -> Result<CompositeBuf>;

	/// Writes the concatenation of `buffers` as one logical message. The
	/// caller keeps ownership of the buffers; the stream writes through
	/// retained views.
	async fn write(&self, buffers: &[ByteBuf], ctx: &OperationContext) -> Result<()>;

	/// Idempotent; afterwards every other operation fails.
	fn close(&self);

	fn address(&self) -> &ServerAddress;

	fn is_closed(&self) -> bool;

	fn get_buffer(&self, size: usize) -> ByteBuf;
}

#[async_trait]
impl<S: Stream + ?Sized> Stream for std::sync::Arc<S> {
	async fn open(&self, ctx: &OperationContext) -> Result<()> {
		(**self).open(ctx).await
	}

	async fn read(&self, count: i32, ctx: &OperationContext) -> Result<CompositeBuf> {
		(**self).read(count, ctx).await
	}

	async fn write(&self, buffers: &[ByteBuf], ctx: &OperationContext) -> Result<()> {
		(**self).write(buffers, ctx).await
	}

	fn close(&self) {
		(**self).close()
	}

	fn address(&self) -> &ServerAddress {
		(**self).address()
	}

	fn is_closed(&self) -> bool {
		(**self).is_closed()
	}

	fn get_buffer(&self, size: usize) -> ByteBuf {
		(**self).get_buffer(size)
	}
}

pub trait StreamFactory: Send + Sync {
	fn create(&self, address: ServerAddress) -> std::sync::Arc<dyn Stream>;
}
