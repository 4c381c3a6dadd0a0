use std::time::Duration;

use serde::Deserialize;

use crate::debug::DebuggerMode;

// Settings the core consumes. Construction is the harness's job; everything
// here is already validated and ready for use. TCP_NODELAY and SO_KEEPALIVE
// are always enabled and intentionally not configurable.

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketSettings {
	#[serde(rename = "connect-timeout-ms")]
	pub connect_timeout_ms: u64,
	/// Scheduled per read; zero means no scheduled timeout.
	#[serde(rename = "read-timeout-ms")]
	pub read_timeout_ms: u64,
	/// Scheduled per write; zero means no scheduled timeout.
	#[serde(rename = "write-timeout-ms")]
	pub write_timeout_ms: u64,
	/// Applied to the socket only when positive.
	#[serde(rename = "send-buffer-bytes")]
	pub send_buffer_bytes: u32,
	/// Applied to the socket only when positive.
	#[serde(rename = "receive-buffer-bytes")]
	pub receive_buffer_bytes: u32,
}

impl Default for SocketSettings {
	fn default() -> Self {
		Self {
			connect_timeout_ms: 10_000,
			read_timeout_ms: 0,
			write_timeout_ms: 0,
			send_buffer_bytes: 0,
			receive_buffer_bytes: 0,
		}
	}
}

impl SocketSettings {
	pub fn connect_timeout(&self) -> Duration {
		Duration::from_millis(self.connect_timeout_ms)
	}

	pub fn read_timeout(&self) -> Duration {
		Duration::from_millis(self.read_timeout_ms)
	}

	pub fn write_timeout(&self) -> Duration {
		Duration::from_millis(self.write_timeout_ms)
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsSettings {
	#[serde(rename = "ssl-enabled")]
	pub enabled: bool,
	/// When false, server certificates are verified against the hostname and
	/// SNI is sent. When true, verification is disabled entirely.
	#[serde(rename = "invalid-hostname-allowed")]
	pub invalid_hostname_allowed: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DebugSettings {
	#[serde(rename = "debugger-mode")]
	pub mode: DebuggerMode,
	/// Events retained per collector ring; must be at least two so the
	/// previous event is always available for order checking.
	#[serde(rename = "event-history-size")]
	pub event_history_size: usize,
}

impl Default for DebugSettings {
	fn default() -> Self {
		Self {
			mode: DebuggerMode::Off,
			event_history_size: 64,
		}
	}
}

impl DebugSettings {
	pub fn validate(&self) -> crate::Result<()> {
		if self.event_history_size < 2 {
			return Err(crate::Error::Configuration(format!(
				"event-history-size must be at least 2, got {}",
				self.event_history_size
			)));
		}
		Ok(())
	}
}

#[cfg(test)]
#[path = "settings_tests.rs"]
mod tests;
