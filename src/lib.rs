pub mod config;
pub mod data;
pub mod diag;
pub mod docker;
pub mod export;
pub mod process;
pub mod procnet;
pub mod source;
pub mod track;

pub mod sink {
    mod args;
    mod nr;
    mod sink;

    pub use args::Args;
    pub use nr::NewRelicClient;
    pub use sink::Sink;
}
