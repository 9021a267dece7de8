pub mod checkpoint;
pub mod common;
pub mod plan;
pub mod profile;
pub mod scheduler;
pub mod session;
pub mod spec;

pub type Error = crate::common::error::WaverunError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = std::collections::HashMap<K, V>;

pub const WAVERUN_VERSION: &str = env!("CARGO_PKG_VERSION");
