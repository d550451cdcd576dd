use arcade_sync::broker::Broker;
use arcade_sync::config::BrokerConfig;
use arcade_sync::logging::{self, LogConfig, LogQueue};

#[tokio::main]
async fn main() {
    let config = match BrokerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("arcade-broker: {e}");
            std::process::exit(2);
        }
    };
    if let Err(e) = logging::init(LogConfig::with_level(&config.log_level)) {
        eprintln!("arcade-broker: logging disabled: {e}");
    }

    let listener = match tokio::net::TcpListener::bind(&config.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("cannot bind {}: {}", config.bind, e);
            LogQueue::shutdown();
            std::process::exit(1);
        }
    };

    let broker = Broker::new(&config);
    let stats = broker.clone();
    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutting down");
        }
    };
    if let Err(e) = broker.serve(listener, shutdown).await {
        log::error!("broker stopped: {}", e);
    }
    log::info!("final counters\n{}", stats.stats().metrics.to_string_pretty());
    LogQueue::shutdown();
}
