pub mod dpe;
pub mod dvf;
pub mod ecb;
pub mod insee;
