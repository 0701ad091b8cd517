pub mod fakes;
pub mod harness;

pub use fakes::*;
pub use harness::{HarnessBuilder, TestHarness, INDEX_REF, OWNER};
