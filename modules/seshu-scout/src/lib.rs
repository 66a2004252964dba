pub mod clients;
pub mod extractors;
pub mod fetch;
pub mod fuzzytime;
pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod timezone;
