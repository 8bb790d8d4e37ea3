//! Component E: concrete backend drivers. Each is a plug-compatible
//! implementation of [`crate::backend::LeaseBackend`] (spec §4.5).

#[cfg(feature = "native-lease")]
pub mod native_lease;

#[cfg(feature = "cas-document")]
pub mod cas_document;

#[cfg(feature = "set-nx")]
pub mod set_nx;
