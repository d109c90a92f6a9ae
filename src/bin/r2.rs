use anyhow::Result;
use clap::{arg, command, ArgAction};
use log::info;
use pomegranate::config::Config;
use pomegranate::node::R2Node;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn main() -> Result<()> {
    let matches = command!()
        .arg(
            arg!(-c --config <FILE> "Path to node config toml")
                .required(false)
                .default_value("r2.toml"),
        )
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`").action(ArgAction::SetTrue))
        .get_matches();

    let config_path = matches.get_one::<String>("config").unwrap();
    let mut config = Config::load_or_default(Some(config_path))?;
    config.verbose |= matches.get_flag("verbose");
    pomegranate::logging::init_logs(config.verbose);

    info!("starting r2 on {} (fsid {})", config.listen, config.fsid);
    let node = Arc::new(R2Node::new(config));

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc_handler(move || stop.store(true, Ordering::SeqCst));
    }

    let hb_period = std::time::Duration::from_secs(node.config.hb_period_secs);
    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(hb_period);
        node.registry.sweep_heartbeats(hb_period);
    }

    info!("r2 shutting down");
    Ok(())
}

/// Installs a `SIGINT` handler using `nix`, matching the teacher's own
/// signal-handling approach in `main.rs`. Core components have no CLI
/// surface of their own beyond this stop flag (spec.md §6 "Exit behaviour").
fn ctrlc_handler(on_signal: impl Fn() + Send + Sync + 'static) {
    use nix::sys::signal;

    static HANDLER: std::sync::OnceLock<Box<dyn Fn() + Send + Sync>> = std::sync::OnceLock::new();
    let _ = HANDLER.set(Box::new(on_signal));

    extern "C" fn dispatch(_: i32) {
        if let Some(handler) = HANDLER.get() {
            handler();
        }
    }

    let action = signal::SigAction::new(
        signal::SigHandler::Handler(dispatch),
        signal::SaFlags::SA_NODEFER,
        signal::SigSet::empty(),
    );
    unsafe {
        let _ = signal::sigaction(signal::SIGINT, &action);
    }
}
