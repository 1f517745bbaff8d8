mod run_record_repository;
mod sample_repository;

pub use run_record_repository::*;
pub use sample_repository::*;
