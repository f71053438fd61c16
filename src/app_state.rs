use std::sync::Arc;

use crate::core::client::prometheus::PromClient;
use crate::core::store::TicketStore;

/// Process-lifetime adapters shared by every request. The handler holds
/// references only; connection lifecycle belongs to startup/shutdown.
#[derive(Clone)]
pub struct AppState {
    pub tickets: Arc<TicketStore>,
    pub metrics: Arc<PromClient>,
}
