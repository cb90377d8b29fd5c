// Pipeline ingestion: raw staging area for downloaded files

pub mod staging;
