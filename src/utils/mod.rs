// src/utils/mod.rs

pub mod csv_importer;
pub mod kev;
pub mod logger;
pub mod nvd_api;
