pub mod fixtures;
pub mod mocks;

#[allow(unused_imports)]
pub use fixtures::{seeded_bytes, sha256_hash, split_stream};
#[allow(unused_imports)]
pub use mocks::InstrumentedBackend;
