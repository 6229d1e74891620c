#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod codec;
pub mod config;
pub mod error;
pub mod gossip;
pub mod handlers;
pub mod id;
pub mod message;
pub mod node;
pub mod outbox;
pub mod pool;
pub mod registry;

pub use config::Config;
pub use node::{Context, Node, NodeBuilder};
pub use registry::{handler_fn, Handler, HandlerResult};
