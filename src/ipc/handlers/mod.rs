pub mod backup;
pub mod core;
pub mod courses;
pub mod exchange;
pub mod gradebook;
pub mod reports;
pub mod students;
pub mod teachers;
