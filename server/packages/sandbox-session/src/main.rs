fn main() {
    if let Err(err) = sandbox_session::cli::run_sandbox_session() {
        tracing::error!(error = %err, "sandbox-session failed");
        std::process::exit(1);
    }
}
