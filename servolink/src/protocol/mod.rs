//! Protocol implementations.

pub mod block;
pub mod command;
pub mod crc;

// Re-export common types
pub use block::BlockFrame;
pub use command::{Command, Inbound, Position, Report, Response, Stroke, parse_line};
