// Pipeline processing: DVF cleaning/deduplication and DPE enrichment

pub mod dvf_clean;
pub mod enrich;
