mod job;
mod position;
mod sample;
mod step;

pub use job::*;
pub use position::*;
pub use sample::*;
pub use step::*;
