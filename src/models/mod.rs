pub mod action;
pub mod reminder;

pub use action::{ActionKind, ActionRow, EngineState, PendingAction, StoreEvent, SyncStatus};
pub use reminder::{
    NewReminderRequest, Reminder, ReminderDate, ReminderFields, ReminderRow, SyncState,
    UpdateReminderRequest,
};
