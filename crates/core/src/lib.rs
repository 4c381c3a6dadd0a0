pub mod buf;
pub mod prelude;
pub mod telemetry;
