pub mod dsl;
pub mod error;
pub mod paths;
pub mod project;
pub mod settings;
pub mod state;
