mod run_record;
mod sample;

pub use run_record::*;
pub use sample::*;
