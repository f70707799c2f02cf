//! Integration test crate for the lodestone DHT.
//!
//! This crate has no library code — it only contains integration tests
//! that exercise end-to-end DHT flows across real UDP sockets on
//! localhost.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p lodestone-integration-tests
//! ```
