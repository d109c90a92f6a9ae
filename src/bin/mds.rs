use anyhow::Result;
use clap::{arg, command, ArgAction};
use log::info;
use pomegranate::config::Config;
use pomegranate::node::MdsNode;
use pomegranate::{Role, SiteId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn main() -> Result<()> {
    let matches = command!()
        .arg(
            arg!(-c --config <FILE> "Path to node config toml")
                .required(false)
                .default_value("mds.toml"),
        )
        .arg(
            arg!(-s --site <ID> "This node's site ordinal (assigned by R2 on first run)")
                .required(false)
                .default_value("1"),
        )
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`").action(ArgAction::SetTrue))
        .get_matches();

    let config_path = matches.get_one::<String>("config").unwrap();
    let mut config = Config::load_or_default(Some(config_path))?;
    config.verbose |= matches.get_flag("verbose");
    pomegranate::logging::init_logs(config.verbose);

    let ordinal: u64 = matches.get_one::<String>("site").unwrap().parse()?;
    let site_id = SiteId::new(Role::Mds, ordinal);

    info!("starting mds {} on {} (fsid {})", site_id, config.listen, config.fsid);
    let node = Arc::new(MdsNode::new(site_id, config));

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        install_sigint(move || stop.store(true, Ordering::SeqCst));
    }

    let txg_period = std::time::Duration::from_secs(node.config.txg_rotate_secs);
    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(txg_period);
        let closed = node.txg.rotate();
        if closed.dirty_count() > 0 {
            info!("rotated txg {}, flushing {} itbs", closed.id, closed.dirty_count());
        }
    }

    info!("mds {} shutting down", site_id);
    Ok(())
}

fn install_sigint(on_signal: impl Fn() + Send + Sync + 'static) {
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
