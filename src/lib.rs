pub mod builder;
pub mod config;
pub mod engine;
pub mod error;
pub mod har;
pub mod intercept;
pub mod lock;
pub mod logging;
pub mod matching;
pub mod mode;
pub mod player;
pub mod proxy;
pub mod recorder;
pub mod remap;
pub mod stateful;
pub mod store;
pub mod upstream;
