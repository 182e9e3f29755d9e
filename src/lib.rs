#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod adapter;
pub mod config;
pub mod error;
pub mod key;
pub mod lookup;
pub mod message;
pub mod replay;
pub mod router;
pub mod subscriber_set;
pub mod table;
pub mod timeout;

pub use adapter::{DownstreamAdapter, UpstreamSink};
pub use config::RouterConfig;
pub use error::RouterError;
pub use message::{Envelope, Message, TxId, NO_TX};
pub use router::Router;

pub type Result<T> = std::result::Result<T, RouterError>;
