use oppwatch::config::Config;
use oppwatch::gemini::GeminiClient;
use oppwatch::reconcile;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    log::info!("agent run starting");
    let model = GeminiClient::new(&config.gemini_api_key);

    if let Err(e) = reconcile::run(&config, &model).await {
        log::error!("run aborted: {}", e);
        std::process::exit(1);
    }

    log::info!("run finished");
}
