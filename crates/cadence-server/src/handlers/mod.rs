//! Route handlers, split by audience.

pub mod admin;
pub mod reviews;
