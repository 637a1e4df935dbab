//! Encrypted write-ahead log storage.
//!
//! [`wal::Wal`] appends records through a [`crypto::Session`] chosen by a
//! [`crypto::ProviderRegistry`]; [`codec`] holds the framing shared by the
//! file-backed log and any other byte stream.

pub mod codec;
pub mod crypto;
pub mod wal;
