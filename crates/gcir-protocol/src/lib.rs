//! gcir-protocol: the Global Caché Unified TCP wire codec.
//!
//! Pure encoding and decoding of the `\r`-terminated ASCII command language
//! spoken by iTach IR blasters: `sendir` synthesis from decoded waveforms,
//! `stopir` and query commands, response classification, and the
//! per-connection request-id sequence. No I/O happens here; the connection
//! layer in `gcir-net` owns the sockets.

pub mod codec;

pub use codec::{
    encode_get_irl, encode_getdevices, encode_getversion, encode_stopir, parse_response,
    RequestIdSeq, Response, SendIr, TERMINATOR,
};
