//! `hdf_host <host_id> <host_name>` – runs one device host process.
//!
//! Startup order: built-in drivers, host object, device manager
//! registration, configured devices.  The host is torn down on Ctrl-C.

mod config;
mod drivers;
mod telemetry;

use hdf_core::{ObjectKind, ObjectRegistry};
use hdf_types::{HdfError, HdfResult};
use tracing::{error, info, warn};

fn main() {
    let (host_id, host_name) = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("usage: hdf_host <host_id> <host_name>");
            std::process::exit(e.exit_code());
        }
    };

    let cfg = match config::load(&host_name) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("[hdf_host] {e}; continuing with defaults");
            let mut cfg = config::HostConfig::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let _guard = telemetry::init_tracing("hdf-host", cfg.log_format);

    if let Err(e) = serve(host_id, &host_name, &cfg) {
        error!(host_id, host = %host_name, error = %e, "device host failed");
        std::process::exit(e.exit_code());
    }
}

/// Parse `<host_id> <host_name>`.
fn parse_args(mut args: impl Iterator<Item = String>) -> HdfResult<(u8, String)> {
    let raw_id = args
        .next()
        .ok_or_else(|| HdfError::InvalidParam("missing host id".into()))?;
    let host_id = raw_id
        .parse::<u8>()
        .map_err(|e| HdfError::InvalidParam(format!("host id '{raw_id}': {e}")))?;
    let host_name = args
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| HdfError::InvalidParam("missing host name".into()))?;
    Ok((host_id, host_name))
}

fn serve(host_id: u8, host_name: &str, cfg: &config::HostConfig) -> HdfResult<()> {
    let registry = ObjectRegistry::new()
        .with_drivers(drivers::builtin_registry()?)
        .with_host(host_id, host_name);
    let host = registry
        .create(ObjectKind::DeviceHostService)?
        .into_host()
        .ok_or_else(|| HdfError::InvalidObject("registry built a non-host object".into()))?;
    host.start_service()?;

    let mut loaded = 0usize;
    for entry in &cfg.devices {
        let info = entry.to_device_info(host_id);
        match host.add_device(&info) {
            Ok(_) => loaded += 1,
            Err(e) => warn!(module = %entry.module_name, device_id = entry.device_id, error = %e, "device skipped"),
        }
    }
    info!(host_id, host = host_name, loaded, configured = cfg.devices.len(), "device host running");

    let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }
    let _ = stop_rx.recv();

    info!(host = host_name, "shutting down");
    registry.release(hdf_core::HdfObject::DeviceHostService(host));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn parses_host_id_and_name() {
        let (id, name) = parse_args(args(&["3", "sample_host"])).unwrap();
        assert_eq!(id, 3);
        assert_eq!(name, "sample_host");
    }

    #[test]
    fn missing_or_malformed_args_are_invalid_param() {
        for bad in [&[][..], &["3"][..], &["x", "h"][..], &["256", "h"][..], &["1", ""][..]] {
            let err = parse_args(args(bad)).unwrap_err();
            assert!(matches!(err, HdfError::InvalidParam(_)), "{bad:?}");
            assert_eq!(err.exit_code(), 3);
        }
    }
}
