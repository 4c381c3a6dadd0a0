use std::collections::VecDeque;
use std::io::IoSlice;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use rmongo_core::buf::{BufferPool, ByteBuf, CompositeBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::settings::SocketSettings;
use crate::transport::{OperationContext, Resolver, ServerAddress, Stream};

const READ_CHUNK_SIZE: usize = 16 * 1024;

/// The underlying socket, with or without TLS.
pub(crate) enum Transport {
	Tcp(TcpStream),
	Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			Transport::Tcp(inner) => Pin::new(inner).poll_read(cx, buf),
			Transport::Tls(inner) => Pin::new(inner).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for Transport {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		match self.get_mut() {
			Transport::Tcp(inner) => Pin::new(inner).poll_write(cx, buf),
			Transport::Tls(inner) => Pin::new(inner).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			Transport::Tcp(inner) => Pin::new(inner).poll_flush(cx),
			Transport::Tls(inner) => Pin::new(inner).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			Transport::Tcp(inner) => Pin::new(inner).poll_shutdown(cx),
			Transport::Tls(inner) => Pin::new(inner).poll_shutdown(cx),
		}
	}

	fn poll_write_vectored(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<std::io::Result<usize>> {
		match self.get_mut() {
			Transport::Tcp(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
			Transport::Tls(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
		}
	}

	fn is_write_vectored(&self) -> bool {
		match self {
			Transport::Tcp(inner) => inner.is_write_vectored(),
			Transport::Tls(inner) => inner.is_write_vectored(),
		}
	}
}

/// The first failure observed on a stream. Latched so every later operation
/// short-circuits with the same condition.
#[derive(Debug, Clone)]
enum StreamFault {
	Closed,
	Inactive,
	DataAfterClose,
	ReadTimeout,
	Io(String),
}

impl StreamFault {
	fn to_error(&self, address: &ServerAddress) -> Error {
		match self {
			StreamFault::Closed => Error::socket(address.to_string(), "stream is closed"),
			StreamFault::Inactive => Error::socket(address.to_string(), "channel is not active"),
			StreamFault::DataAfterClose => {
				Error::socket(address.to_string(), "received data after the stream was closed")
			},
			StreamFault::ReadTimeout => Error::ReadTimeout {
				address: address.to_string(),
			},
			StreamFault::Io(message) => Error::socket(address.to_string(), message.clone()),
		}
	}
}

/// The single outstanding reader waiting for more inbound bytes.
struct PendingReader {
	wanted: usize,
	tx: oneshot::Sender<Result<CompositeBuf>>,
	timeout: Option<JoinHandle<()>>,
}

type SharedWriter = Arc<tokio::sync::Mutex<WriteHalf<Transport>>>;

#[derive(Default)]
struct StreamInner {
	pending_inbound: VecDeque<ByteBuf>,
	pending_reader: Option<PendingReader>,
	fault: Option<StreamFault>,
	closed: bool,
	writer: Option<SharedWriter>,
	driver: Option<JoinHandle<()>>,
}

struct StreamState {
	address: ServerAddress,
	inner: Mutex<StreamInner>,
}

enum ReadOutcome {
	Ready(Result<CompositeBuf>),
	Installed(oneshot::Receiver<Result<CompositeBuf>>),
}

impl StreamState {
	fn available(inner: &StreamInner) -> usize {
		inner.pending_inbound.iter().map(|b| b.remaining()).sum()
	}

	fn release_queued(inner: &mut StreamInner) {
		for buf in inner.pending_inbound.drain(..) {
			buf.release();
		}
	}

	/// Drains FIFO components covering exactly `wanted` bytes. Whole head
	/// buffers move into the composite; the last one is consumed through a
	/// retained slice of just the bytes still needed.
	fn drain_locked(inner: &mut StreamInner, wanted: usize) -> CompositeBuf {
		let mut parts = Vec::new();
		let mut need = wanted;
		while need > 0 {
			let head_remaining = inner
				.pending_inbound
				.front()
				.expect("drain_locked called without enough buffered bytes")
				.remaining();
			if head_remaining <= need {
				let head = inner.pending_inbound.pop_front().unwrap();
				need -= head_remaining;
				parts.push(head);
			} else {
				let head = inner.pending_inbound.front_mut().unwrap();
				parts.push(head.retained_slice(need));
				need = 0;
				if head.remaining() == 0 {
					inner.pending_inbound.pop_front().unwrap().release();
				}
			}
		}
		CompositeBuf::new(parts)
	}

	/// The read algorithm. Runs under the lock; the caller completes outside it.
	fn begin_read(state: &Arc<StreamState>, wanted: usize, timeout: Duration) -> ReadOutcome {
		let mut inner = state.inner.lock().unwrap();
		if let Some(fault) = &inner.fault {
			return ReadOutcome::Ready(Err(fault.to_error(&state.address)));
		}
		if inner.closed || inner.writer.is_none() {
			let fault = if inner.closed {
				StreamFault::Closed
			} else {
				StreamFault::Inactive
			};
			inner.fault = Some(fault.clone());
			Self::release_queued(&mut inner);
			return ReadOutcome::Ready(Err(fault.to_error(&state.address)));
		}
		if Self::available(&inner) < wanted {
			let (tx, rx) = oneshot::channel();
			// A fresh timeout is armed only here, by the public read call. The
			// inbound continuation resumes the reader without re-arming, so
			// timeouts never stack.
			let timeout_task = (timeout > Duration::ZERO).then(|| {
				let state = state.clone();
				tokio::spawn(async move {
					tokio::time::sleep(timeout).await;
					state.on_read_timeout();
				})
			});
			// Concurrent pending readers are a broken caller contract; the
			// debugger layer detects them. Displacing the old reader drops its
			// sender, which surfaces to that caller as an interrupted wait.
			if let Some(displaced) = inner.pending_reader.replace(PendingReader {
				wanted,
				tx,
				timeout: timeout_task,
			}) {
				if let Some(timeout) = displaced.timeout {
					timeout.abort();
				}
			}
			return ReadOutcome::Installed(rx);
		}
		let composite = Self::drain_locked(&mut inner, wanted);
		ReadOutcome::Ready(Ok(composite))
	}

	/// Resumes the pending reader if it can complete, successfully or through
	/// the latched fault. Cancels its timeout and clears the slot. The returned
	/// delivery must be performed outside the lock.
	fn resume_pending(
		&self,
		inner: &mut StreamInner,
	) -> Option<(oneshot::Sender<Result<CompositeBuf>>, Result<CompositeBuf>)> {
		let ready = match &inner.pending_reader {
			None => false,
			Some(_) if inner.fault.is_some() => true,
			Some(reader) => Self::available(inner) >= reader.wanted,
		};
		if !ready {
			return None;
		}
		let reader = inner.pending_reader.take().unwrap();
		if let Some(timeout) = reader.timeout {
			timeout.abort();
		}
		let result = match &inner.fault {
			Some(fault) => Err(fault.to_error(&self.address)),
			None => Ok(Self::drain_locked(inner, reader.wanted)),
		};
		Some((reader.tx, result))
	}

	/// Invoked by the inbound driver whenever the peer delivers bytes.
	fn handle_inbound(&self, buf: ByteBuf) {
		let delivery = {
			let mut inner = self.inner.lock().unwrap();
			if inner.closed || inner.writer.is_none() {
				// Not retained: the buffer never enters the queue.
				inner.fault.get_or_insert(StreamFault::DataAfterClose);
				buf.release();
				self.resume_pending(&mut inner)
			} else {
				inner.pending_inbound.push_back(buf);
				self.resume_pending(&mut inner)
			}
		};
		if let Some((tx, result)) = delivery {
			deliver(tx, result);
		}
	}

	/// Latches a failure and fails the pending reader, if any.
	fn fail(&self, fault: StreamFault) {
		let delivery = {
			let mut inner = self.inner.lock().unwrap();
			inner.fault.get_or_insert(fault);
			self.resume_pending(&mut inner)
		};
		if let Some((tx, result)) = delivery {
			deliver(tx, result);
		}
	}

	fn on_read_timeout(&self) {
		let delivery = {
			let mut inner = self.inner.lock().unwrap();
			if inner.pending_reader.is_none() {
				// The read completed while this task was firing.
				return;
			}
			inner.fault.get_or_insert(StreamFault::ReadTimeout);
			self.resume_pending(&mut inner)
		};
		if let Some((tx, result)) = delivery {
			deliver(tx, result);
		}
		debug!(address = %self.address, "read timed out, closing the stream");
		self.close_stream();
	}

	fn close_stream(&self) {
		let (queued, driver, reader) = {
			let mut inner = self.inner.lock().unwrap();
			if inner.closed {
				return;
			}
			inner.closed = true;
			let queued: Vec<ByteBuf> = inner.pending_inbound.drain(..).collect();
			inner.writer = None;
			(queued, inner.driver.take(), inner.pending_reader.take())
		};
		for buf in queued {
			buf.release();
		}
		if let Some(reader) = reader {
			if let Some(timeout) = reader.timeout {
				timeout.abort();
			}
			deliver(reader.tx, Err(StreamFault::Closed.to_error(&self.address)));
		}
		if let Some(driver) = driver {
			driver.abort();
		}
		// The driver may have enqueued concurrently with the drain above;
		// sweep anything that raced in.
		let raced: Vec<ByteBuf> = {
			let mut inner = self.inner.lock().unwrap();
			inner.pending_inbound.drain(..).collect()
		};
		for buf in raced {
			buf.release();
		}
	}

	fn is_closed(&self) -> bool {
		self.inner.lock().unwrap().closed
	}
}

/// Delivers a completion exactly once. If the receiving future is already
/// gone, the buffer is released here so it cannot leak.
fn deliver(tx: oneshot::Sender<Result<CompositeBuf>>, result: Result<CompositeBuf>) {
	if let Err(unclaimed) = tx.send(result) {
		if let Ok(buf) = unclaimed {
			buf.release();
		}
	}
}

async fn drive_inbound(state: Arc<StreamState>, mut reader: ReadHalf<Transport>, pool: BufferPool) {
	loop {
		let mut chunk = BytesMut::with_capacity(READ_CHUNK_SIZE);
		match reader.read_buf(&mut chunk).await {
			Ok(0) => {
				state.fail(StreamFault::Io("connection closed by the peer".to_string()));
				break;
			},
			Ok(n) => {
				trace!(bytes = n, "inbound chunk");
				state.handle_inbound(pool.wrap_inbound(chunk.freeze()));
			},
			Err(e) => {
				state.fail(StreamFault::Io(e.to_string()));
				break;
			},
		}
	}
}

/// A tokio-backed stream. All shared state lives behind one mutex; completions
/// are delivered outside it.
#[derive(Clone)]
pub struct AsyncStream {
	settings: SocketSettings,
	tls: Option<Arc<rustls::ClientConfig>>,
	pool: BufferPool,
	resolver: Arc<dyn Resolver>,
	state: Arc<StreamState>,
}

impl AsyncStream {
	pub fn new(
		address: ServerAddress,
		settings: SocketSettings,
		tls: Option<Arc<rustls::ClientConfig>>,
		pool: BufferPool,
		resolver: Arc<dyn Resolver>,
	) -> Self {
		Self {
			settings,
			tls,
			pool,
			resolver,
			state: Arc::new(StreamState {
				address,
				inner: Mutex::new(StreamInner::default()),
			}),
		}
	}

	async fn connect_candidate(
		&self,
		addr: std::net::SocketAddr,
		connect_timeout: Duration,
	) -> std::io::Result<TcpStream> {
		let connect = TcpStream::connect(addr);
		let stream = if connect_timeout > Duration::ZERO {
			tokio::time::timeout(connect_timeout, connect)
				.await
				.map_err(|_| {
					std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")
				})??
		} else {
			connect.await?
		};
		self.apply_socket_options(&stream)?;
		Ok(stream)
	}

	fn apply_socket_options(&self, stream: &TcpStream) -> std::io::Result<()> {
		stream.set_nodelay(true)?;
		let sock = socket2::SockRef::from(stream);
		sock.set_keepalive(true)?;
		if self.settings.send_buffer_bytes > 0 {
			sock.set_send_buffer_size(self.settings.send_buffer_bytes as usize)?;
		}
		if self.settings.receive_buffer_bytes > 0 {
			sock.set_recv_buffer_size(self.settings.receive_buffer_bytes as usize)?;
		}
		Ok(())
	}
}

#[async_trait]
impl Stream for AsyncStream {
	async fn open(&self, ctx: &OperationContext) -> Result<()> {
		let address = self.state.address.clone();
		let candidates = self.resolver.resolve(&address).await?;
		if candidates.is_empty() {
			return Err(Error::SocketOpen {
				address: address.to_string(),
				source: None,
			});
		}

		// Try each resolved address in order; the last failure is reported.
		let mut last_error = None;
		let mut connected = None;
		for candidate in candidates {
			match self.connect_candidate(candidate, ctx.connect_timeout).await {
				Ok(stream) => {
					connected = Some(stream);
					break;
				},
				Err(e) => {
					debug!(address = %candidate, error = %e, "candidate address failed");
					last_error = Some(e);
				},
			}
		}
		let tcp = connected.ok_or(Error::SocketOpen {
			address: address.to_string(),
			source: last_error,
		})?;

		let transport = match &self.tls {
			Some(config) => {
				let handshake =
					crate::transport::tls::connect(config.clone(), &address.host, tcp);
				let tls = if ctx.connect_timeout > Duration::ZERO {
					tokio::time::timeout(ctx.connect_timeout, handshake)
						.await
						.map_err(|_| {
							Error::socket(address.to_string(), "TLS handshake timed out")
						})??
				} else {
					handshake.await?
				};
				Transport::Tls(Box::new(tls))
			},
			None => Transport::Tcp(tcp),
		};

		let (read_half, write_half) = tokio::io::split(transport);
		let driver = tokio::spawn(drive_inbound(
			self.state.clone(),
			read_half,
			self.pool.clone(),
		));

		let mut inner = self.state.inner.lock().unwrap();
		if inner.closed {
			// close() raced the open; the fresh channel must not survive it.
			driver.abort();
			return Err(Error::socket(
				address.to_string(),
				"stream was closed during open",
			));
		}
		inner.writer = Some(Arc::new(tokio::sync::Mutex::new(write_half)));
		inner.driver = Some(driver);
		Ok(())
	}

	async fn read(&self, count: i32, ctx: &OperationContext) -> Result<CompositeBuf> {
		if count < 0 {
			return Err(Error::NegativeRead { requested: count });
		}
		match StreamState::begin_read(&self.state, count as usize, ctx.read_timeout) {
			ReadOutcome::Ready(result) => result,
			ReadOutcome::Installed(rx) => match rx.await {
				Ok(result) => result,
				Err(_) => Err(Error::Interrupted),
			},
		}
	}

	async fn write(&self, buffers: &[ByteBuf], ctx: &OperationContext) -> Result<()> {
		let address = self.state.address.to_string();
		let writer = {
			let inner = self.state.inner.lock().unwrap();
			if inner.closed {
				return Err(Error::socket(address, "stream is closed"));
			}
			match &inner.writer {
				Some(writer) => writer.clone(),
				None => return Err(Error::socket(address, "channel is not active")),
			}
		};

		// Retained read-only views: releasing the composite after the write
		// leaves the caller's buffers untouched.
		let mut composite = CompositeBuf::new(buffers.iter().map(|b| b.duplicate()).collect());
		let total = composite.remaining();
		let io = async {
			let mut guard = writer.lock().await;
			guard.write_all_buf(&mut composite).await?;
			guard.flush().await
		};
		let result = if ctx.write_timeout > Duration::ZERO {
			match tokio::time::timeout(ctx.write_timeout, io).await {
				Ok(result) => result,
				Err(_) => {
					composite.release();
					return Err(Error::socket(
						self.state.address.to_string(),
						"write timed out",
					));
				},
			}
		} else {
			io.await
		};
		composite.release();
		trace!(bytes = total, "write completed");
		result.map_err(|e| Error::socket(self.state.address.to_string(), e.to_string()))
	}

	fn close(&self) {
		self.state.close_stream();
	}

	fn address(&self) -> &ServerAddress {
		&self.state.address
	}

	fn is_closed(&self) -> bool {
		self.state.is_closed()
	}

	fn get_buffer(&self, size: usize) -> ByteBuf {
		self.pool.get_buffer(size)
	}
}

#[cfg(test)]
#[path = "stream_tests.rs"]
mod tests;
