// src/orders/mod.rs

pub mod tracker;

pub use tracker::PendingOrderTracker;
