pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod headers;
pub mod logging;
pub mod matcher;
pub mod options;
pub mod proxy;
pub mod render;
pub mod simulate;
pub mod store;
pub mod summary;
pub mod tape;
pub mod upstream;
