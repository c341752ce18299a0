//! Background tasks.
//!
//! Each task runs until its cancellation token fires:
//! - [`bbb_cost`] refreshes BBB server costs from live meeting telemetry
//! - [`room_view_cleanup`] closes room views abandoned by crashed sessions

pub mod bbb_cost;
pub mod room_view_cleanup;

pub use bbb_cost::{refresh_bbb_costs, start_bbb_cost_refresher};
pub use room_view_cleanup::{cleanup_room_views, start_room_view_cleanup};
