fn main() {
    if let Err(err) = sensordash_lib::run() {
        eprintln!("sensordash: {err:#}");
        std::process::exit(1);
    }
}
