pub mod catalog;
pub mod cli;
pub mod config;
pub mod digits;
pub mod error;
pub mod events;
pub mod files;
pub mod loader;
pub mod navigator;
pub mod queue;
pub mod thumbs;

#[cfg(test)]
mod test_support;
