//! Wire schema shared by the Orchestrator and the ModelServer, generated from
//! `proto/orchestration.proto` at build time.

pub mod v1 {
    tonic::include_proto!("orchestration.v1");
}

pub use v1::*;
