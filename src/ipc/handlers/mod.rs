pub mod attendance;
pub mod backup;
pub mod core;
pub mod courses;
pub mod roster_import;
pub mod rooms;
pub mod schedules;
pub mod sections;
pub mod sessions;
pub mod setup;
pub mod students;
