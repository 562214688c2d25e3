mod breaker_tests;
mod common;
mod limiter_tests;
mod queue_store_tests;
