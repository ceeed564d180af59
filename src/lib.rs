pub mod bus;
pub mod chunk;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod hexdump;
pub mod logging;
pub mod ports;
pub mod reader;
pub mod stats;

pub use chunk::{Chunk, Origin};
pub use config::AppConfig;
pub use engine::{CaptureState, Engine};
pub use error::CaptureError;
