//! memproxy - transparent memory layer for chat LLM APIs
//!
//! This crate provides a reverse proxy that sits between chat clients and
//! their provider (Anthropic, OpenAI, Google, or any configured upstream).
//! Each credential gets its own memory context; eligible chat requests have
//! their history replaced by what that context remembers.

pub mod config;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod provider;
pub mod proxy;
pub mod session;

pub use error::ProxyError;
