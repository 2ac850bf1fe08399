//! Notifications: the unread counter and the notification list.

mod center;
mod counter;

pub use center::NotificationCenter;
pub use counter::UnreadCounter;
