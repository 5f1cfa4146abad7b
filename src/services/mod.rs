// src/services/mod.rs

pub mod comparison;
pub mod key_pool;
pub mod retrieval;
