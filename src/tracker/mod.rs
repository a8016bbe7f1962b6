//! Tracker detection.
//!
//! Filter lists are parsed once per process into [`FilterRules`];
//! [`TrackerDetector`] flags the requests and cookies of one scan against them.

mod detect;
mod filter;

pub use detect::{TRACKING_KEY, TrackerDetector, TrackingSummary, extract_tracking};
pub use filter::{DEFAULT_FILTER_LISTS, FilterError, FilterRules};
