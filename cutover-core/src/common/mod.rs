//! Common utilities shared across components

pub mod async_utils;

pub use async_utils::{poll_until, with_timeout};
