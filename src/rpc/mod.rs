//! RPC & networking (spec §4.H): a framed, ZSTD-compressed request/reply
//! protocol over TCP, with reconnecting clients and a handler-dispatching
//! server. Used by the distributed model-and-replay service to expose
//! `requestModel`/`requestStateDict`/`trainData`/`gameResult` and by
//! trainers/actors to call them.

pub mod client;
pub mod message;
pub mod server;
pub mod transport;

pub use client::RpcClient;
pub use message::{Reply, Request, Status};
pub use server::RpcServer;
