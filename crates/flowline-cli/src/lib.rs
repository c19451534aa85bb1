//! Library surface shared between the `flowline` binary and its tests: the
//! Management API router and state.

pub mod api;
