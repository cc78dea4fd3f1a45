//! Shared dependency container for workers and the HTTP layer.

use std::sync::Arc;

use crate::config::Config;
use crate::kernel::bmc::BmcConnector;
use crate::kernel::dedup::DeliveryCache;
use crate::kernel::iso::IsoBuilder;
use crate::kernel::media::UrlSigner;
use crate::kernel::store::Store;

pub struct ServerDeps {
    pub config: Config,
    pub store: Arc<Store>,
    pub iso: Arc<IsoBuilder>,
    pub signer: Arc<UrlSigner>,
    pub bmc: Arc<dyn BmcConnector>,
    pub deliveries: Arc<DeliveryCache>,
}

impl ServerDeps {
    pub fn new(config: Config, store: Arc<Store>, bmc: Arc<dyn BmcConnector>) -> Arc<Self> {
        let iso = Arc::new(IsoBuilder::new(config.task_iso_dir()));
        let signer = Arc::new(UrlSigner::new(
            config.media_base_url.clone(),
            config.signing_secret.clone(),
            config.signed_url_ttl(),
            config.bind_media_to_ip,
        ));

        Arc::new(Self {
            config,
            store,
            iso,
            signer,
            bmc,
            deliveries: Arc::new(DeliveryCache::new()),
        })
    }

    /// Where the in-guest dispatcher reports status for a server.
    pub fn callback_url(&self, serial: &str) -> String {
        format!(
            "{}/api/v1/status-webhook/{serial}",
            self.config.media_base_url.trim_end_matches('/')
        )
    }
}
