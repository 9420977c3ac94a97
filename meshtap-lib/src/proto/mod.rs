//! Wire formats: fragmentation chunks, secure packets, DataProto frames and
//! peer signalling messages.

pub mod dataproto;
pub mod fragment;
pub mod signal;
pub mod spp;
