//! # Live Test Utilities
//!
//! Shared test utilities for the venueless live server.
//!
//! This crate provides fixtures and an in-process session harness for
//! exercising the protocol without Redis or a network socket.
//!
//! ## Modules
//!
//! - `fixtures` - Builders for worlds, rooms and signed world tokens
//! - `harness` - `TestLiveServer` and `TestClient` driving real consumers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use live_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let world = TestWorldBuilder::new().connection_limit(1).build();
//!     let server = TestLiveServer::spawn(world).await;
//!
//!     let mut client = server.connect().await;
//!     let hello = client.authenticate_anonymous("4").await;
//!     assert_eq!(hello["user"]["kind"], "anonymous");
//!
//!     let room = server.add_room(TestRoomBuilder::new("Stage").build()).await;
//!     client.call("room.enter", json!({"room": room.id})).await;
//! }
//! ```

pub mod fixtures;
pub mod harness;

pub use fixtures::*;
pub use harness::*;
