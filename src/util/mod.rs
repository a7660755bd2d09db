// src/util/mod.rs

pub mod arena;

pub use arena::{Arena, ArenaIndex};
