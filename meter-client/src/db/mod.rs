pub mod catalog_queries;
pub mod reading_queries;
