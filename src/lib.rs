pub mod adapters;
pub mod core;
pub mod runtime;

pub use runtime::api::App;

pub fn run() {
    env_logger::init();
    if let Err(error) = runtime::run() {
        log::error!("trellis failed to start: {error}");
        std::process::exit(1);
    }
}
