#![allow(clippy::upper_case_acronyms)]

use pingora_core::server::configuration::Opt;

use xypriss::config::Config;
use xypriss::console::{ConsoleInterceptor, InterceptorOptions};
use xypriss::server::AppContext;

/// Environment variable relaying the config path to worker processes.
const CONF_ENV: &str = "XYPRISS_CONF";

fn main() {
    // Read command-line arguments
    let mut opt = Opt::parse_args();

    // Workers inherit the master's config path through the environment.
    if opt.conf.is_none() {
        if let Ok(path) = std::env::var(CONF_ENV) {
            opt.conf = Some(path);
        }
    }
    if let Some(path) = &opt.conf {
        std::env::set_var(CONF_ENV, path);
    }

    // Load configuration with optional override
    let config = Config::load_yaml_with_opt_override(&opt).expect("Failed to load configuration");

    // Initialize logging through the console interceptor
    let interception = config.logging.console_interception.clone();
    let options = if interception.enabled {
        interception.to_options()
    } else {
        InterceptorOptions {
            enabled: false,
            ..Default::default()
        }
    };
    ConsoleInterceptor::install(options).expect("Failed to install logger");

    log::info!("Assembling application...");
    let app = AppContext::from_config(config).expect("Failed to assemble application");

    log::info!("Starting server...");
    if let Err(e) = app.run(opt) {
        log::error!("server exited: {e}");
        std::process::exit(1);
    }
}
