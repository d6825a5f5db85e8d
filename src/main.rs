fn main() {
    if let Err(e) = fng_tracker::run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
