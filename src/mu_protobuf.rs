//! Wire schema for Mu envelopes, generated from `proto/mu.proto`.

include!(concat!(env!("OUT_DIR"), "/mu.rs"));
