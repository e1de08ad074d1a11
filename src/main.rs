fn main() {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();

    if let Err(e) = medivoice_client::run() {
        eprintln!("medivoice: {}", e);
        std::process::exit(1);
    }
}
