//! Infrastructure layer: job persistence, leasing, and the scheduler loop.

pub mod jobs;
