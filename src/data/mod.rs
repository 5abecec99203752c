//! Sample buffering and storage.
pub mod ring_buffer;
pub mod storage;
