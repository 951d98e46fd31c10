//! HTTP API: event stream, probe acknowledgments, admin and metrics endpoints.

pub mod app;
