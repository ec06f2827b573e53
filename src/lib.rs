pub mod jsonrpc;

pub use jsonrpc::*;
