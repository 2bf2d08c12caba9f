use std::process;

use structopt::StructOpt;

use nautilus::cli::{self, Nautilus};

fn setup_logger(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{}] {}", record.level(), message))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()
        .expect("logger initialised twice");
}

fn main() {
    let options = Nautilus::from_args();
    setup_logger(std::env::var("NAUTILUS_DEBUG").is_ok());
    if let Err(error) = cli::run(options) {
        log::error!("{:#}", error);
        process::exit(1);
    }
}
