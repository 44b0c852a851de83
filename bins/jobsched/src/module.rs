use jobs_core::store::Db;
use tokio::task::JoinHandle;

use crate::events::EventBus;

#[derive(Clone)]
pub struct ModuleCtx {
    pub db: Db,
    pub events: EventBus,
    pub shutdown: tokio::sync::watch::Receiver<bool>,
}

impl ModuleCtx {
    /// Resolves once shutdown has been requested (or the sender is gone).
    pub async fn stopped(&mut self) {
        while !*self.shutdown.borrow() {
            if self.shutdown.changed().await.is_err() {
                return;
            }
        }
    }
}

pub trait Module: Send + 'static {
    fn name(&self) -> &'static str;
    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>>;
}
