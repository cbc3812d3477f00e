use cinder_api_operator::config::OperatorConfig;
use cinder_api_operator::runner::run_operator;

const OPERATOR_NAME: &str = "cinder-api-operator";

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = OperatorConfig::new(OPERATOR_NAME);
    if let Some(namespace) = std::env::var("WATCH_NAMESPACE").ok().filter(|ns| !ns.is_empty()) {
        config = config.within_namespace(namespace);
    }
    if let Ok(port) = std::env::var("OPERATOR_SERVER_PORT") {
        match port.parse::<u16>() {
            Ok(port) => config = config.server_port(port),
            Err(err) => log::warn!("Ignoring invalid OPERATOR_SERVER_PORT '{}': {}", port, err),
        }
    }

    let err = run_operator(config);
    log::error!("{} exited with error: {}", OPERATOR_NAME, err);
    std::process::exit(1);
}
