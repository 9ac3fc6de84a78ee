//! CMake Server protocol client
//!
//! - [`codec`]: marker-delimited message framing
//! - [`protocol`]: message and payload types
//! - [`client`]: process ownership, handshake and cookie correlation

pub mod client;
pub mod codec;
pub mod error;
pub mod protocol;

#[cfg(test)]
pub mod testing;

pub use client::{
    ClientParams, CmsClient, CmsHandlers, MAX_GARBLED_MESSAGES, ProgressEvent, paths_equivalent,
};
pub use codec::{CmsCodec, CodecError};
pub use error::CmsError;
pub use protocol::{CmakeInputs, CodeModel, CodeModelTarget, GlobalSettings, GlobalSettingsUpdate};
