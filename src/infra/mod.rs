pub mod cdn;
pub mod db;
pub mod error;
pub mod memory;
pub mod renderer;
pub mod telemetry;
