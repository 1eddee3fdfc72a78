pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod listener;
pub mod llm;
pub mod summarize;
pub mod telegram;

use std::sync::Arc;

/// Long-lived service objects, built once at process entry and shared by
/// reference with the listener and the command front-end.
pub struct Services {
    pub config: config::Config,
    pub db: db::Database,
    pub summarizer: summarize::SummarizationManager,
}

impl Services {
    pub fn new(config: config::Config) -> anyhow::Result<Self> {
        let db = db::Database::new(&config)?;
        db.execute_init()?;

        let gateway = Arc::new(llm::GatewayClient::new(&config)?);
        let summarizer = summarize::SummarizationManager::new(db.clone(), gateway, &config);

        Ok(Self {
            config,
            db,
            summarizer,
        })
    }
}
