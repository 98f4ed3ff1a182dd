//! The burrow protocol engine: a reliable, ordered, multiplexed transport
//! for tunnelled IP packets running on top of plain UDP datagrams (or TCP
//! streams used purely as a framing layer).
//!
//! The crate is organized leaves-first: the wire `codec` and `message`
//! entities at the bottom, the `merger`/`retry`/`ack` machinery above them,
//! the `server`/`client` transports above that, and the `usecase` layer
//! tying sessions, tunnel interfaces and transports together at the top.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod ack;
pub mod cancel;
pub mod client;
pub mod codec;
pub mod compress;
pub mod config;
pub mod conn;
pub mod error;
pub mod iface;
pub mod merger;
pub mod message;
pub mod packet;
pub mod retry;
pub mod sequence;
pub mod server;
pub mod stat;
pub mod tun;
pub mod usecase;
