mod job_guard;

pub use job_guard::JobGuard;
