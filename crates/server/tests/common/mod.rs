//! Common test utilities and fixtures.

pub mod fixtures;
pub mod records;
pub mod server;
pub mod storage;

#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use records::*;
#[allow(unused_imports)]
pub use server::*;
#[allow(unused_imports)]
pub use storage::*;
