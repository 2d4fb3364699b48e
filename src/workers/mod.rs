//! Long-running workers

pub mod inbox;
