//! gcir-test-harness: test utilities for gcir.
//!
//! Provides [`MockBlaster`], a protocol-aware mock iTach endpoint for
//! deterministic testing of connection management, dispatch, and error
//! handling without real hardware.

pub mod mock_blaster;

pub use mock_blaster::{MockBlaster, ReplyMode, MOCK_VERSION};
