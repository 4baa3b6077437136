//! Domain model: identifiers, task rows, the reminder wire message, and the
//! error classification used across ports.

pub mod errors;
pub mod ids;
pub mod message;
pub mod task;

pub use self::errors::ErrorKind;
pub use self::ids::{ChannelId, DeliveryTag, TaskId};
pub use self::message::{CONTENT_TYPE_JSON, MessageError, ReminderMessage};
pub use self::task::{NewTask, RowVersion, TaskRecord, TaskRef, is_due_for_reminder};
