use std::process::Command;

/// The engine fails fast on an unopenable database rather than limping along
/// without a repository store.
#[test]
fn fails_with_unreachable_database() {
    let exe = env!("CARGO_BIN_EXE_code-exec-engine");
    let output = Command::new(exe)
        .env("DATABASE_URL", "sqlite:///nonexistent/directory/engine.db")
        .env("RUST_LOG", "error")
        .output()
        .expect("failed to run engine binary");
    assert!(!output.status.success());
}
