//! HTTP request handlers for the sentiment API.

mod api;
mod sentiment;

pub use api::health;
pub use sentiment::{sentiment_current, sentiment_day, sentiment_month, sentiment_week};
