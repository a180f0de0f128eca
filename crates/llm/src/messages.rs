//! The unified message model shared by every converter.

pub mod unified;
