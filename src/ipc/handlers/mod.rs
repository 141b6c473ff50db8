pub mod analytics;
pub mod core;
pub mod exams;
pub mod results;
pub mod scholarship;
pub mod students;
pub mod submissions;
