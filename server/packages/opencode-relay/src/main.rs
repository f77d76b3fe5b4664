fn main() {
    if let Err(err) = opencode_relay::cli::run_opencode_relay() {
        tracing::error!(error = %err, "opencode-relay failed");
        std::process::exit(1);
    }
}
