pub mod api_key;
pub mod comparison;
pub mod cve;
pub mod scan;
