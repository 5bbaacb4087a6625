use commsync::config::load_config;
use commsync::db::Warehouse;
use commsync::server::{serve, AppState};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    };

    let db = match Warehouse::open() {
        Ok(db) => db,
        Err(e) => {
            log::error!("failed to open warehouse: {e}");
            std::process::exit(1);
        }
    };

    let addr = config.listen_addr.clone();
    if let Err(e) = serve(AppState::new(db, config), &addr).await {
        log::error!("server error: {e}");
        std::process::exit(1);
    }
}
