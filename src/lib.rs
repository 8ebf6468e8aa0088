pub mod engine;
pub mod error;
pub mod script;
pub mod settings;
pub mod transcript;
