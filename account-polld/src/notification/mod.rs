//! Notification delivery.
//!
//! Supervisors hand successful poll results to a [`NotificationSink`]. The
//! daemon's sink is a [`PostOffice`] which applies the overflow policy per
//! batch and posts each message through a [`PostalTransport`].

mod app_id;
mod batch;
mod post_office;
mod sink;

pub use app_id::{ApplicationId, POSTAL_OBJECT_PATH_PREFIX};
pub use batch::{OverflowHandler, PushMessageBatch};
pub use post_office::{
    DEFAULT_POST_OFFICE_CAPACITY, PostOffice, PostalTransport, consolidate,
};
pub use sink::{Delivery, NotificationSink, PostOfficeHandle};
