pub mod rdata;
pub mod validation_dataset;
