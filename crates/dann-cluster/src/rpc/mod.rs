//! RPC surface: length-prefixed binary framing over TCP.
//!
//! Every frame is a `u32` big-endian length followed by a bincode-encoded
//! message. One request/response pair per method; the same channel also
//! carries the internal replication and anti-entropy exchanges.

mod client;
mod codec;
mod messages;
mod server;

pub use client::{RpcClient, RpcClientPool};
pub use codec::{read_frame, write_frame, MAX_FRAME_BYTES};
pub use messages::{
    AddVectorsRequest, AddVectorsResponse, HealthResponse, RpcRequest, RpcResponse,
    SearchRequest, SearchResponse, StatsResponse, VectorEntry,
};
pub use server::RpcServer;
