//! Open a connectivity chip over UART, print what it reports and reset it.
//!
//! ```text
//! cargo run --example reset_probe -- /dev/ttyACM0 [soft|system] [config.json]
//! ```

use std::env;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sdlink_core::prelude::*;

struct Printer;

impl AdapterListener for Printer {
    fn on_status(&self, status: &LinkStatus, _user_data: Option<&UserData>) {
        println!("status: {:?}", status);
    }

    fn on_event(&self, payload: &[u8], _user_data: Option<&UserData>) {
        println!("event:  {:02x?}", payload);
    }

    fn on_log(&self, severity: LogSeverity, message: &str, _user_data: Option<&UserData>) {
        println!("log:    [{}] {}", severity, message);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    let Some(port) = args.get(1) else {
        bail!("usage: reset_probe <port> [soft|system] [config.json]");
    };
    let mode = match args.get(2).map(String::as_str) {
        None | Some("soft") => ResetMode::SoftReset,
        Some("system") => ResetMode::SystemReset,
        Some(other) => bail!("unknown reset mode '{}'", other),
    };

    let mut config = match args.get(3) {
        Some(path) => AdapterConfig::load(path).with_context(|| format!("loading {}", path))?,
        None => AdapterConfig::default(),
    };
    config.serial.port_name = port.clone();

    let adapter = config.build_adapter().context("creating adapter")?;
    adapter.set_log_severity_filter(LogSeverity::Debug);
    adapter
        .open(Arc::new(Printer), UserDataTokens::default())
        .with_context(|| format!("opening {}", port))?;
    println!("link active on {} ({:?})", port, adapter.link_state());

    adapter.conn_reset(mode).context("connectivity reset")?;
    println!("{:?} accepted", mode);

    // the firmware announces itself again after a reset
    thread::sleep(Duration::from_secs(1));
    println!("{:?}", adapter.link_stats());
    adapter.close()?;
    Ok(())
}
