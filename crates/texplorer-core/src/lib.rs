pub mod dispose;
pub mod errors;
pub mod events;
pub mod host;
pub mod ids;
pub mod level;
pub mod tree;
