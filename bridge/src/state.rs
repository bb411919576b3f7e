//! Shared application state handed to every pipeline and handler.

use std::sync::Arc;

use crate::billing::BillingProvider;
use crate::board::BoardProvider;
use crate::cache::AttachmentCache;
use crate::config::Config;
use crate::relay::MailRelay;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub board: Arc<dyn BoardProvider>,
    pub relay: Arc<dyn MailRelay>,
    pub billing: Arc<dyn BillingProvider>,
    pub cache: AttachmentCache,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Store,
        board: Arc<dyn BoardProvider>,
        relay: Arc<dyn MailRelay>,
        billing: Arc<dyn BillingProvider>,
    ) -> Self {
        let cache = AttachmentCache::new(config.attachment_cache_dir.clone());
        Self {
            config: Arc::new(config),
            store: Arc::new(store),
            board,
            relay,
            billing,
            cache,
        }
    }
}

#[cfg(test)]
pub mod testing {
    use tempfile::TempDir;

    use super::*;
    use crate::billing::testing::FakeBilling;
    use crate::board::testing::FakeBoard;
    use crate::relay::testing::FakeRelay;
    use crate::store::test_utils::store_with_address;

    /// Bot member id used by test configs.
    pub const BOT_ID: &str = "bot";

    /// State wired to fakes, with handles kept for assertions.
    pub struct Harness {
        pub state: AppState,
        pub board: Arc<FakeBoard>,
        pub relay: Arc<FakeRelay>,
        pub billing: Arc<FakeBilling>,
        _cache_dir: TempDir,
    }

    impl Harness {
        /// Harness over a store holding the self-sending address `a@x.com`
        /// (user `u1`, list `l1`).
        pub fn new() -> Self {
            Self::with(FakeBoard::new(), FakeRelay::new(), FakeBilling::new())
        }

        pub fn with(board: FakeBoard, relay: FakeRelay, billing: FakeBilling) -> Self {
            let cache_dir = tempfile::tempdir().expect("cache dir");
            let config = Config {
                base_domain: "x.com".to_string(),
                service_url: "https://bridge.test".to_string(),
                trello_bot_id: BOT_ID.to_string(),
                attachment_cache_dir: cache_dir.path().to_path_buf(),
                ..Config::default()
            };
            let board = Arc::new(board);
            let relay = Arc::new(relay);
            let billing = Arc::new(billing);
            let state = AppState::new(
                config,
                store_with_address(),
                board.clone(),
                relay.clone(),
                billing.clone(),
            );
            Self {
                state,
                board,
                relay,
                billing,
                _cache_dir: cache_dir,
            }
        }

        pub fn store(&self) -> &Store {
            &self.state.store
        }
    }
}
