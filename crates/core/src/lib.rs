//! Core crate for the wanvid image-to-video service.

pub mod config;
pub mod fetch;
pub mod generate;
pub mod logging;
pub mod output;
pub mod pipeline;
pub mod server;
pub mod storage;

#[cfg(test)]
mod testing;
