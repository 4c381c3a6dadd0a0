// End-to-end scenarios against real loopback listeners: the full stack from
// the protocol engine through the debugger interposer down to TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bson::{Document, doc};
use rmongo::debug::{ConnectionDebugger, DebuggerMode, DebugStream, EventType, OperationCode};
use rmongo::error::Error;
use rmongo::protocol::write::WriteConcern;
use rmongo::protocol::{Connection, Namespace};
use rmongo::settings::{DebugSettings, SocketSettings, TlsSettings};
use rmongo::transport::factory::AsyncStreamFactory;
use rmongo::transport::sync::{RuntimeGroup, SyncStream};
use rmongo::transport::{OperationContext, ServerAddress, Stream, StreamFactory};
use rmongo::MessageSettings;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn bind() -> (TcpListener, SocketAddr) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	(listener, addr)
}

fn factory() -> AsyncStreamFactory {
	AsyncStreamFactory::new(
		SocketSettings::default(),
		&TlsSettings::default(),
		RuntimeGroup::shared(tokio::runtime::Handle::current()),
	)
	.unwrap()
}

fn address_of(addr: SocketAddr) -> ServerAddress {
	ServerAddress::new("127.0.0.1", addr.port())
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
	for _ in 0..200 {
		if condition() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("condition not reached within two seconds");
}

/// Reads one wire message off a server-side socket.
async fn read_message(socket: &mut TcpStream) -> Option<Vec<u8>> {
	let mut header = [0u8; 16];
	socket.read_exact(&mut header).await.ok()?;
	let length = i32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
	let mut message = header.to_vec();
	message.resize(length, 0);
	socket.read_exact(&mut message[16..]).await.ok()?;
	Some(message)
}

fn request_id_of(message: &[u8]) -> i32 {
	i32::from_le_bytes(message[4..8].try_into().unwrap())
}

/// Extracts the command document from an OP_QUERY message.
fn command_document_of(message: &[u8]) -> Document {
	// header(16) + flags(4), then the cstring collection name.
	let mut at = 20;
	while message[at] != 0 {
		at += 1;
	}
	at += 1; // NUL
	at += 8; // skip + number-to-return
	Document::from_reader(&mut &message[at..]).unwrap()
}

fn encode_reply(response_to: i32, documents: &[Document]) -> Vec<u8> {
	let mut body = Vec::new();
	for doc in documents {
		doc.to_writer(&mut body).unwrap();
	}
	let total = 16 + 20 + body.len();
	let mut out = Vec::with_capacity(total);
	out.extend_from_slice(&(total as i32).to_le_bytes());
	out.extend_from_slice(&900i32.to_le_bytes());
	out.extend_from_slice(&response_to.to_le_bytes());
	out.extend_from_slice(&1i32.to_le_bytes()); // OP_REPLY
	out.extend_from_slice(&0i32.to_le_bytes()); // response flags
	out.extend_from_slice(&0i64.to_le_bytes()); // cursor id
	out.extend_from_slice(&0i32.to_le_bytes()); // starting from
	out.extend_from_slice(&(documents.len() as i32).to_le_bytes());
	out.extend_from_slice(&body);
	out
}

#[tokio::test]
async fn open_write_read_against_an_echo_listener() {
	let (listener, addr) = bind().await;
	let server = tokio::spawn(async move {
		let (mut socket, _) = listener.accept().await.unwrap();
		let mut bytes = [0u8; 16];
		socket.read_exact(&mut bytes).await.unwrap();
		socket.write_all(&bytes).await.unwrap();
		socket.flush().await.unwrap();
		let _ = socket.read(&mut [0u8; 1]).await;
	});

	let factory = factory();
	let stream = factory.create(address_of(addr));
	let ctx = factory.operation_context();
	stream.open(&ctx).await.unwrap();

	let mut out = stream.get_buffer(16);
	out.put_slice(b"0123456789ABCDEF");
	out.flip();
	stream.write(std::slice::from_ref(&out), &ctx).await.unwrap();
	out.release();

	let echoed = stream.read(16, &ctx).await.unwrap();
	assert_eq!(echoed.to_vec(), b"0123456789ABCDEF");
	echoed.release();

	stream.close();
	// No buffer handed out by the shared pool is still retained.
	wait_for(|| factory.pool().outstanding() == 0).await;
	server.abort();
}

#[tokio::test]
async fn invalid_reply_header_is_debugged_and_raised() {
	let (listener, addr) = bind().await;
	let server = tokio::spawn(async move {
		let (mut socket, _) = listener.accept().await.unwrap();
		let request = read_message(&mut socket).await.unwrap();
		// A 16-byte header framing nothing, with a nonsense op code.
		let mut reply = Vec::new();
		reply.extend_from_slice(&16i32.to_le_bytes());
		reply.extend_from_slice(&900i32.to_le_bytes());
		reply.extend_from_slice(&request_id_of(&request).to_le_bytes());
		reply.extend_from_slice(&50_361_199i32.to_le_bytes());
		socket.write_all(&reply).await.unwrap();
		socket.flush().await.unwrap();
		let _ = socket.read(&mut [0u8; 1]).await;
	});

	let factory = factory();
	let debugger = ConnectionDebugger::new(&DebugSettings {
		mode: DebuggerMode::LogAndThrow,
		event_history_size: 32,
	});
	let stream = Arc::new(DebugStream::new(
		factory.create(address_of(addr)),
		debugger.clone(),
	));
	let ctx = factory.operation_context();
	stream.open(&ctx).await.unwrap();

	let conn = Connection::new(stream.clone(), debugger.clone(), MessageSettings::default());
	let err = conn
		.run_command("db", doc! { "ping": 1 }, &ctx)
		.await
		.unwrap_err();
	assert_matches!(&err, Error::Debugging(e) if matches!(
		e.cause(),
		Some(Error::Wire(rmongo_wire::WireError::InvalidReplyHeader { .. }))
	));

	let d = debugger.enabled().unwrap();
	// The bytes were read successfully; only the decode failed.
	let counters = d.io().snapshot();
	assert_eq!(counters.message_headers, 0);
	assert_eq!(counters.failed_reads, 0);
	assert!(counters.successful_reads >= 1);

	let stream_events = d.stream_ops().history();
	assert!(stream_events.iter().any(|e| e.code == OperationCode::Read
		&& e.event_type == EventType::EndSuccess));
	let conn_events = d.connection_ops().history();
	assert!(conn_events.iter().any(|e| e.code == OperationCode::DecodeReplyHeader
		&& e.event_type == EventType::EndFailure));

	stream.close();
	server.abort();
}

#[tokio::test]
async fn bulk_write_splits_and_merges_across_batches() {
	let (listener, addr) = bind().await;
	// A minimal write-command server: count the documents of each insert
	// batch and acknowledge them.
	let server = tokio::spawn(async move {
		let (mut socket, _) = listener.accept().await.unwrap();
		let mut batches = Vec::new();
		while let Some(message) = read_message(&mut socket).await {
			let command = command_document_of(&message);
			let count = command.get_array("documents").unwrap().len();
			batches.push(count);
			let reply = encode_reply(
				request_id_of(&message),
				&[doc! { "ok": 1, "n": count as i32 }],
			);
			if socket.write_all(&reply).await.is_err() {
				break;
			}
		}
		batches
	});

	let factory = factory();
	let stream = factory.create(address_of(addr));
	let ctx = factory.operation_context();
	stream.open(&ctx).await.unwrap();

	let settings = MessageSettings {
		max_batch_count: 2,
		..MessageSettings::default()
	};
	let conn = Connection::new(stream.clone(), ConnectionDebugger::off(), settings);
	let documents: Vec<Document> = (0..5).map(|i| doc! { "_id": i as i32 }).collect();
	let result = conn
		.execute_write_command(
			&Namespace::new("db", "c"),
			rmongo_wire::command::WriteCommand::Insert(documents),
			true,
			&WriteConcern::ACKNOWLEDGED,
			&ctx,
		)
		.await
		.unwrap();

	// Lossless split: three physical batches covering all five items.
	assert_eq!(result.inserted_count, 5);
	stream.close();
	let batches = server.await.unwrap();
	assert_eq!(batches, vec![2, 2, 1]);
}

#[tokio::test]
async fn get_last_error_round_trip_over_loopback() {
	let (listener, addr) = bind().await;
	let server = tokio::spawn(async move {
		let (mut socket, _) = listener.accept().await.unwrap();
		// OP_INSERT arrives first and gets no reply.
		let _insert = read_message(&mut socket).await.unwrap();
		// The getlasterror query is answered with a duplicate-key error.
		let gle = read_message(&mut socket).await.unwrap();
		let reply = encode_reply(
			request_id_of(&gle),
			&[doc! { "ok": 1, "n": 0, "err": "E11000 duplicate key", "code": 11000 }],
		);
		socket.write_all(&reply).await.unwrap();
		let _ = socket.read(&mut [0u8; 1]).await;
	});

	let factory = factory();
	let stream = factory.create(address_of(addr));
	let ctx = factory.operation_context();
	stream.open(&ctx).await.unwrap();

	let conn = Connection::new(stream.clone(), ConnectionDebugger::off(), MessageSettings::default());
	let err = conn
		.execute_insert(
			&Namespace::new("db", "c"),
			vec![doc! { "_id": 1 }],
			&WriteConcern::ACKNOWLEDGED,
			&ctx,
		)
		.await
		.unwrap_err();
	assert_matches!(err, Error::DuplicateKey { code: 11000, .. });

	stream.close();
	server.abort();
}

#[test]
fn blocking_stream_over_an_owned_runtime() {
	// A plain std echo server thread; the factory owns its runtime and the
	// caller drives everything through the blocking adapter.
	let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
	let addr = listener.local_addr().unwrap();
	let server = std::thread::spawn(move || {
		let (mut socket, _) = listener.accept().unwrap();
		let mut bytes = [0u8; 4];
		std::io::Read::read_exact(&mut socket, &mut bytes).unwrap();
		std::io::Write::write_all(&mut socket, &bytes).unwrap();
	});

	let factory = AsyncStreamFactory::new(
		SocketSettings::default(),
		&TlsSettings::default(),
		RuntimeGroup::owned().unwrap(),
	)
	.unwrap();
	let stream = SyncStream::new(factory.create(address_of(addr)), factory.handle());
	let ctx = factory.operation_context();

	stream.open(&ctx).unwrap();
	let mut out = stream.get_buffer(4);
	out.put_slice(b"ping");
	out.flip();
	stream.write(std::slice::from_ref(&out), &ctx).unwrap();
	out.release();

	let echoed = stream.read(4, &ctx).unwrap();
	assert_eq!(echoed.to_vec(), b"ping");
	echoed.release();
	stream.close();
	server.join().unwrap();
	// Dropping the factory shuts down the runtime it owns.
	drop(factory);
}

#[tokio::test]
async fn command_reply_document_round_trip() {
	let (listener, addr) = bind().await;
	let server = tokio::spawn(async move {
		let (mut socket, _) = listener.accept().await.unwrap();
		let request = read_message(&mut socket).await.unwrap();
		let command = command_document_of(&request);
		assert_eq!(command.get_i32("ping").unwrap(), 1);
		let reply = encode_reply(request_id_of(&request), &[doc! { "ok": 1.0 }]);
		socket.write_all(&reply).await.unwrap();
		let _ = socket.read(&mut [0u8; 1]).await;
	});

	let factory = factory();
	let stream = factory.create(address_of(addr));
	let ctx = factory.operation_context();
	stream.open(&ctx).await.unwrap();

	let conn = Connection::new(stream.clone(), ConnectionDebugger::off(), MessageSettings::default());
	let reply = conn.run_command("admin", doc! { "ping": 1 }, &ctx).await.unwrap();
	assert_eq!(reply.get_f64("ok").unwrap(), 1.0);

	stream.close();
	wait_for(|| factory.pool().outstanding() == 0).await;
	server.abort();
}
