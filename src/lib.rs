pub mod concurrency;
pub mod config;
pub mod processor;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ServerConfig;
pub use processor::{MethodProcessor, Processor};
pub use server::{Dispatch, Server, ServerError};
