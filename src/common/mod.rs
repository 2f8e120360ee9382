pub mod serde_compat;
pub mod split;
