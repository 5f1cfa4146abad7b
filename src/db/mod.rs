// src/db/mod.rs

pub mod connection;
pub mod schema;
