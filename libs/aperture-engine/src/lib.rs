pub mod chain;
pub mod controller;
pub mod error;
pub mod meta;
pub mod registry;
pub mod shared_memory;
