use std::sync::Arc;

use tracing::info;

use crate::config::RunConfig;
use crate::dispatch::{Dispatcher, RunSummary};
use crate::domain::Record;
use crate::error::HarvestError;
use crate::input::read_records;
use crate::output::ProgressSink;
use crate::placement::Placement;
use crate::rate_limit::RateLimiter;
use crate::resolver::{OaLookup, Resolver, UnpaywallClient};
use crate::result_log::ResultLog;
use crate::session::{HttpSessionFactory, SessionFactory};

/// One configured harvest: input table in, sharded PDFs and a result log
/// out.
pub struct App<L: OaLookup, F: SessionFactory> {
    config: RunConfig,
    resolver: Resolver<L>,
    factory: F,
}

impl App<UnpaywallClient, HttpSessionFactory> {
    /// Production wiring: Unpaywall lookups behind a shared rate limiter and
    /// HTTP download sessions.
    pub fn from_config(config: RunConfig) -> Result<Self, HarvestError> {
        let limiter = Arc::new(RateLimiter::new(config.metadata_interval));
        let lookup = UnpaywallClient::new(
            &config.metadata_base_url,
            &config.email,
            &config.user_agent,
            limiter,
        )?;
        let factory = HttpSessionFactory::new(&config.user_agent)?;
        Ok(Self::new(config, lookup, factory))
    }
}

impl<L: OaLookup, F: SessionFactory> App<L, F> {
    pub fn new(config: RunConfig, lookup: L, factory: F) -> Self {
        Self {
            config,
            resolver: Resolver::new(lookup),
            factory,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Reads the input table and runs it. Setup failures abort before any
    /// worker starts.
    pub fn run(&self, sink: &dyn ProgressSink) -> Result<RunSummary, HarvestError> {
        let records = read_records(&self.config.input, &self.config.columns, self.config.limit)?;
        if let Some(limit) = self.config.limit {
            info!(limit, "limited run");
        }
        self.run_records(&records, sink)
    }

    pub fn run_records(
        &self,
        records: &[Record],
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, HarvestError> {
        let placement = Placement::new(self.config.output_root.clone(), self.config.shard_size);
        placement.ensure_root()?;
        let log = ResultLog::open(&self.config.log_path, self.config.append_log)?;

        Dispatcher::new(
            &self.config,
            &self.resolver,
            &self.factory,
            &placement,
            &log,
            sink,
        )
        .run(records)
    }
}
