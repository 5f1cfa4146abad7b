// src/repositories/mod.rs

pub mod api_key_repo;
pub mod cache_repo;
pub mod scan_repo;
