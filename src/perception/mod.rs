pub mod fingerprint;
#[cfg(feature = "desktop")]
pub mod screenshot;
pub mod types;
