use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use bytes::{Buf, Bytes, BytesMut};

// Explicitly reference-counted buffers. Rust ownership covers the memory itself;
// the ledger exists so the driver can account for every buffer handed across the
// stream boundary (inbound queue -> caller, caller -> outbound composite) and so
// tests can assert that nothing leaks once a connection is torn down.
//
// A ByteBuf starts in write mode, where bytes are appended at the write cursor.
// flip() freezes it into read mode, where the read cursor advances towards the
// limit. duplicate(), as_read_only() and retained_slice() hand out read-mode
// views over the same storage, sharing the same reference count.

#[derive(Debug, Default)]
pub struct PoolTracker {
	acquired: AtomicU64,
	released: AtomicU64,
}

impl PoolTracker {
	pub fn acquired(&self) -> u64 {
		self.acquired.load(Ordering::Acquire)
	}

	pub fn released(&self) -> u64 {
		self.released.load(Ordering::Acquire)
	}

	pub fn outstanding(&self) -> u64 {
		self.acquired() - self.released()
	}
}

/// Hands out tracked buffers with power-of-two backing allocations.
#[derive(Debug, Clone, Default)]
pub struct BufferPool {
	tracker: Arc<PoolTracker>,
}

impl BufferPool {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get_buffer(&self, size: usize) -> ByteBuf {
		self.tracker.acquired.fetch_add(1, Ordering::AcqRel);
		ByteBuf::tracked(size, Some(self.tracker.clone()))
	}

	/// Wraps bytes delivered by the I/O runtime into a tracked read-mode buffer.
	pub fn wrap_inbound(&self, bytes: Bytes) -> ByteBuf {
		self.tracker.acquired.fetch_add(1, Ordering::AcqRel);
		let len = bytes.len();
		ByteBuf {
			ledger: Ledger::new(Some(self.tracker.clone())),
			storage: Storage::Read(bytes),
			cap: len,
			pos: 0,
			limit: len,
		}
	}

	/// Buffers acquired but not yet released to a zero reference count.
	pub fn outstanding(&self) -> u64 {
		self.tracker.outstanding()
	}

	pub fn tracker(&self) -> &Arc<PoolTracker> {
		&self.tracker
	}
}

#[derive(Debug, Clone)]
struct Ledger {
	refs: Arc<AtomicI32>,
	tracker: Option<Arc<PoolTracker>>,
}

impl Ledger {
	fn new(tracker: Option<Arc<PoolTracker>>) -> Self {
		Self {
			refs: Arc::new(AtomicI32::new(1)),
			tracker,
		}
	}

	fn count(&self) -> i32 {
		self.refs.load(Ordering::Acquire)
	}

	fn retain(&self) {
		let prev = self.refs.fetch_add(1, Ordering::AcqRel);
		assert!(prev > 0, "retain on a buffer with reference count {prev}");
	}

	fn release(&self) {
		let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
		assert!(prev > 0, "release on a buffer with reference count {prev}");
		if prev == 1 {
			if let Some(tracker) = &self.tracker {
				tracker.released.fetch_add(1, Ordering::AcqRel);
			}
		}
	}
}

const INITIAL_BACKING: usize = 8 * 1024;

#[derive(Debug)]
enum Storage {
	Write(BytesMut),
	Read(Bytes),
}

#[derive(Debug)]
pub struct ByteBuf {
	ledger: Ledger,
	storage: Storage,
	cap: usize,
	// Read cursor and limit; only meaningful in read mode.
	pos: usize,
	limit: usize,
}

impl ByteBuf {
	/// An untracked buffer, for callers that do not go through a pool.
	pub fn with_capacity(cap: usize) -> Self {
		Self::tracked(cap, None)
	}

	fn tracked(cap: usize, tracker: Option<Arc<PoolTracker>>) -> Self {
		// Capacity is the overflow bound the caller asked for; the backing
		// allocation starts at a small power of two and grows on demand, so a
		// max-message-sized capacity does not eagerly allocate that much.
		let backing = cap.min(INITIAL_BACKING).next_power_of_two();
		Self {
			ledger: Ledger::new(tracker),
			storage: Storage::Write(BytesMut::with_capacity(backing)),
			cap,
			pos: 0,
			limit: cap,
		}
	}

	/// A read-mode buffer over existing bytes, refcount 1.
	pub fn from_bytes(bytes: Bytes) -> Self {
		let len = bytes.len();
		Self {
			ledger: Ledger::new(None),
			storage: Storage::Read(bytes),
			cap: len,
			pos: 0,
			limit: len,
		}
	}

	pub fn capacity(&self) -> usize {
		self.cap
	}

	pub fn is_read_mode(&self) -> bool {
		matches!(self.storage, Storage::Read(_))
	}

	/// Current cursor: the write position in write mode, the read position after flip().
	pub fn position(&self) -> usize {
		self.check_accessible();
		match &self.storage {
			Storage::Write(m) => m.len(),
			Storage::Read(_) => self.pos,
		}
	}

	pub fn limit(&self) -> usize {
		match &self.storage {
			Storage::Write(_) => self.cap,
			Storage::Read(_) => self.limit,
		}
	}

	/// Restricts the readable region. Only legal in read mode.
	pub fn set_limit(&mut self, limit: usize) {
		match &self.storage {
			Storage::Write(_) => panic!("limit cannot be changed while the buffer is in write mode"),
			Storage::Read(b) => {
				assert!(limit <= b.len(), "limit {limit} exceeds length {}", b.len());
				self.limit = limit;
			},
		}
	}

	/// Space left to write in write mode, bytes left to read in read mode.
	pub fn remaining(&self) -> usize {
		self.check_accessible();
		match &self.storage {
			Storage::Write(m) => self.cap - m.len(),
			Storage::Read(_) => self.limit - self.pos,
		}
	}

	pub fn has_remaining(&self) -> bool {
		self.remaining() > 0
	}

	/// Swaps the buffer from write mode into read mode.
	pub fn flip(&mut self) {
		self.check_accessible();
		match std::mem::replace(&mut self.storage, Storage::Read(Bytes::new())) {
			Storage::Write(m) => {
				let frozen = m.freeze();
				self.pos = 0;
				self.limit = frozen.len();
				self.storage = Storage::Read(frozen);
			},
			Storage::Read(_) => panic!("flip on a buffer already in read mode"),
		}
	}

	/// Discards all content and returns to an empty write-mode buffer.
	pub fn clear(&mut self) {
		self.check_accessible();
		self.storage = Storage::Write(BytesMut::with_capacity(
			self.cap.min(INITIAL_BACKING).next_power_of_two(),
		));
		self.pos = 0;
		self.limit = self.cap;
	}

	fn writable(&mut self, len: usize) -> &mut BytesMut {
		self.check_accessible();
		match &mut self.storage {
			Storage::Write(m) => {
				assert!(
					m.len() + len <= self.cap,
					"write of {len} bytes exceeds remaining capacity ({} of {})",
					self.cap - m.len(),
					self.cap
				);
				m
			},
			Storage::Read(_) => panic!("write on a buffer in read mode"),
		}
	}

	pub fn put_u8(&mut self, v: u8) {
		self.writable(1).extend_from_slice(&[v]);
	}

	pub fn put_i32_le(&mut self, v: i32) {
		self.writable(4).extend_from_slice(&v.to_le_bytes());
	}

	pub fn put_i64_le(&mut self, v: i64) {
		self.writable(8).extend_from_slice(&v.to_le_bytes());
	}

	pub fn put_f64_le(&mut self, v: f64) {
		self.writable(8).extend_from_slice(&v.to_le_bytes());
	}

	pub fn put_slice(&mut self, src: &[u8]) {
		self.writable(src.len()).extend_from_slice(src);
	}

	/// Overwrites four bytes at an absolute index within the written region.
	/// This is how message encoders back-patch tentative lengths.
	pub fn set_i32_le(&mut self, index: usize, v: i32) {
		self.check_accessible();
		match &mut self.storage {
			Storage::Write(m) => {
				assert!(
					index + 4 <= m.len(),
					"set_i32_le at {index} is outside the written region ({})",
					m.len()
				);
				m[index..index + 4].copy_from_slice(&v.to_le_bytes());
			},
			Storage::Read(_) => panic!("set_i32_le on a buffer in read mode"),
		}
	}

	fn readable_checked(&self, len: usize) -> &[u8] {
		self.check_accessible();
		match &self.storage {
			Storage::Read(b) => {
				assert!(
					self.pos + len <= self.limit,
					"read of {len} bytes exceeds remaining limit ({} of {})",
					self.limit - self.pos,
					self.limit
				);
				&b[self.pos..self.pos + len]
			},
			Storage::Write(_) => panic!("read on a buffer in write mode"),
		}
	}

	pub fn get_u8(&mut self) -> u8 {
		let v = self.readable_checked(1)[0];
		self.pos += 1;
		v
	}

	pub fn get_i32_le(&mut self) -> i32 {
		let v = i32::from_le_bytes(self.readable_checked(4).try_into().unwrap());
		self.pos += 4;
		v
	}

	pub fn get_i64_le(&mut self) -> i64 {
		let v = i64::from_le_bytes(self.readable_checked(8).try_into().unwrap());
		self.pos += 8;
		v
	}

	pub fn get_f64_le(&mut self) -> f64 {
		let v = f64::from_le_bytes(self.readable_checked(8).try_into().unwrap());
		self.pos += 8;
		v
	}

	/// Typed read at an absolute index; the cursor does not move.
	pub fn get_i32_le_at(&self, index: usize) -> i32 {
		self.check_accessible();
		match &self.storage {
			Storage::Read(b) => {
				assert!(index + 4 <= self.limit, "index {index} outside limit {}", self.limit);
				i32::from_le_bytes(b[index..index + 4].try_into().unwrap())
			},
			Storage::Write(_) => panic!("indexed read on a buffer in write mode"),
		}
	}

	/// The readable region, without consuming it.
	pub fn readable(&self) -> &[u8] {
		self.check_accessible();
		match &self.storage {
			Storage::Read(b) => &b[self.pos..self.limit],
			Storage::Write(m) => &m[..],
		}
	}

	/// A retained view sharing storage and reference count, with independent cursors.
	pub fn duplicate(&self) -> ByteBuf {
		self.check_accessible();
		match &self.storage {
			Storage::Read(b) => {
				self.ledger.retain();
				ByteBuf {
					ledger: self.ledger.clone(),
					storage: Storage::Read(b.clone()),
					cap: self.cap,
					pos: self.pos,
					limit: self.limit,
				}
			},
			Storage::Write(_) => panic!("duplicate on a buffer in write mode; flip() first"),
		}
	}

	pub fn as_read_only(&self) -> ByteBuf {
		self.duplicate()
	}

	/// Consumes `len` bytes from the read cursor into a retained view of exactly
	/// those bytes. Storage and reference count are shared with `self`.
	pub fn retained_slice(&mut self, len: usize) -> ByteBuf {
		self.check_accessible();
		match &self.storage {
			Storage::Read(b) => {
				assert!(
					self.pos + len <= self.limit,
					"slice of {len} bytes exceeds remaining limit"
				);
				self.ledger.retain();
				let view = b.slice(self.pos..self.pos + len);
				self.pos += len;
				ByteBuf {
					ledger: self.ledger.clone(),
					storage: Storage::Read(view),
					cap: len,
					pos: 0,
					limit: len,
				}
			},
			Storage::Write(_) => panic!("retained_slice on a buffer in write mode"),
		}
	}

	pub fn retain(&self) {
		self.ledger.retain();
	}

	pub fn release(&self) {
		self.ledger.release();
	}

	pub fn reference_count(&self) -> i32 {
		self.ledger.count()
	}

	fn check_accessible(&self) {
		assert!(
			self.ledger.count() > 0,
			"access to a buffer whose reference count dropped to zero"
		);
	}
}

// Read-only Buf view; all three methods require read mode. The inherent
// remaining() above is mode-dependent and shadows this one on direct calls.
impl Buf for ByteBuf {
	fn remaining(&self) -> usize {
		self.check_accessible();
		match &self.storage {
			Storage::Read(_) => self.limit - self.pos,
			Storage::Write(_) => panic!("Buf view of a buffer in write mode"),
		}
	}

	fn chunk(&self) -> &[u8] {
		self.readable()
	}

	fn advance(&mut self, cnt: usize) {
		let _ = self.readable_checked(cnt);
		self.pos += cnt;
	}
}

/// A contiguous view over non-contiguous read-mode components, without copying.
#[derive(Debug, Default)]
pub struct CompositeBuf {
	components: Vec<ByteBuf>,
}

impl CompositeBuf {
	pub fn new(components: Vec<ByteBuf>) -> Self {
		Self { components }
	}

	pub fn empty() -> Self {
		Self::default()
	}

	pub fn push(&mut self, buf: ByteBuf) {
		self.components.push(buf);
	}

	pub fn component_count(&self) -> usize {
		self.components.len()
	}

	pub fn remaining(&self) -> usize {
		self.components.iter().map(|c| c.limit - c.pos).sum()
	}

	pub fn has_remaining(&self) -> bool {
		self.remaining() > 0
	}

	/// Copies the remaining readable bytes out, in order. Diagnostic/test helper;
	/// the hot paths consume through the Buf impl instead.
	pub fn to_vec(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(self.remaining());
		for c in &self.components {
			out.extend_from_slice(c.readable());
		}
		out
	}

	/// Releases every component. The composite owns its components, so this is
	/// the single release point for a buffer assembled by a read.
	pub fn release(self) {
		for c in &self.components {
			c.release();
		}
	}
}

impl Buf for CompositeBuf {
	fn remaining(&self) -> usize {
		CompositeBuf::remaining(self)
	}

	fn chunk(&self) -> &[u8] {
		for c in &self.components {
			if c.pos < c.limit {
				return c.readable();
			}
		}
		&[]
	}

	fn advance(&mut self, mut cnt: usize) {
		for c in &mut self.components {
			let here = (c.limit - c.pos).min(cnt);
			c.pos += here;
			cnt -= here;
			if cnt == 0 {
				return;
			}
		}
		assert!(cnt == 0, "advance past the end of a composite buffer");
	}
}

#[cfg(test)]
#[path = "buf_tests.rs"]
mod tests;
