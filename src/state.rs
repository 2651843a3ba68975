use std::sync::Arc;

use crate::store::ReminderStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ReminderStore>,
}
