pub use proptest::prelude::*;
pub use test_strategy::proptest;
