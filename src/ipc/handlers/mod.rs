pub mod attendance;
pub mod backup;
pub mod classes;
pub mod core;
pub mod scheduler;
pub mod sessions;
pub mod students;
