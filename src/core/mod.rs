pub mod analysis;
pub mod chunker;
pub mod config;
pub mod error;
pub mod io;
pub mod normalize;
pub mod state;
pub mod timeline;
