fn main() {
    if let Err(e) = deskpilot::run() {
        eprintln!("deskpilot: {e}");
        std::process::exit(1);
    }
}
