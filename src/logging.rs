//! Log initialisation, mirroring the teacher's `init_logs()` call site: a
//! `--verbose` flag forces `RUST_LOG=debug` before handing off to
//! `env_logger`.

use std::env::set_var;

pub fn init_logs(verbose: bool) {
    if verbose && std::env::var("RUST_LOG").is_err() {
        set_var("RUST_LOG", "debug");
    }
    let _ = env_logger::try_init();
}
