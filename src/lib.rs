//! Drive a zoned block device through a fixed pipeline of asynchronous I/O commands and verify
//! that every stage completes before the next one starts.
pub mod config;
pub mod error;
pub mod geometry;
pub mod pipeline;
pub mod report;
pub mod stage;

mod backpressure;
mod barrier;

#[cfg(test)]
mod tests;
