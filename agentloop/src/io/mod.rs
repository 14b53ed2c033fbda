//! Side-effecting collaborators: configuration, model clients, environments,
//! template rendering, and trajectory files.

pub mod config;
pub mod environment;
pub mod model;
pub mod prompt;
pub mod shell;
pub mod trajectory;
