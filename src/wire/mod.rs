//! The binary key-value wire protocol: frame header/body codec, per-opcode request/response
//! encoding, and the HTTP codec used by the non-KV services (spec §4.A).

pub(crate) mod frame;
pub(crate) mod framing_extras;
pub(crate) mod http;
pub(crate) mod kv_ops;
pub(crate) mod opcode;
