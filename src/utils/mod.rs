pub mod backoff;
pub mod serde;
