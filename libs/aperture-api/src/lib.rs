pub mod error;
pub mod frame;
pub mod meta;
pub mod plugin;
