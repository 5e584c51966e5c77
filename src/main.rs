fn main() {
    env_logger::init();
    let matches = genibridge::cli::parse_args();

    if let Err(err) = genibridge::cli::actions::run(&matches) {
        log::error!("{err:#}");
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
