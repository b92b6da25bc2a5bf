//! Message classification.
//!
//! Decides which destinations a record is delivered to. Severity gates whether
//! a record is notified at all; the presence of an error context, never the
//! level, gates subscriber delivery.

use crate::config::NotifyConfig;
use crate::filter::should_notify;
use crate::types::{Destination, LogRecord, Severity};

/// The set of destinations a record is delivered to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DestinationSet {
    channel: bool,
    subscribers: bool,
}

impl DestinationSet {
    /// The empty set.
    pub const NONE: Self = Self {
        channel: false,
        subscribers: false,
    };

    /// Returns true if the set contains `destination`.
    #[must_use]
    pub const fn contains(&self, destination: Destination) -> bool {
        match destination {
            Destination::Channel => self.channel,
            Destination::Subscribers => self.subscribers,
        }
    }

    /// Returns the number of destinations.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.channel as usize + self.subscribers as usize
    }

    /// Returns true if no destination is selected.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.channel && !self.subscribers
    }

    /// Iterates the destinations, channel first.
    pub fn iter(&self) -> impl Iterator<Item = Destination> + '_ {
        [Destination::Channel, Destination::Subscribers]
            .into_iter()
            .filter(|d| self.contains(*d))
    }
}

/// Classifies records against one invocation's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classifier {
    threshold: Severity,
    has_subscribers: bool,
}

impl Classifier {
    /// Creates a classifier.
    #[must_use]
    pub const fn new(threshold: Severity, has_subscribers: bool) -> Self {
        Self {
            threshold,
            has_subscribers,
        }
    }

    /// Creates a classifier from a resolved configuration.
    #[must_use]
    pub fn from_config(config: &NotifyConfig) -> Self {
        Self::new(config.enabled_level, config.has_subscribers())
    }

    /// Returns the notification threshold.
    #[must_use]
    pub const fn threshold(&self) -> Severity {
        self.threshold
    }

    /// Returns the destinations `record` should be delivered to.
    #[must_use]
    pub fn classify(&self, record: &LogRecord) -> DestinationSet {
        if !should_notify(record.level, self.threshold) {
            return DestinationSet::NONE;
        }

        DestinationSet {
            channel: true,
            subscribers: self.has_subscribers && record.has_error_context(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorContext;
    use proptest::prelude::*;

    fn record(level: Severity, with_error: bool) -> LogRecord {
        let record = LogRecord::new(level, "something happened");
        if with_error {
            record.with_error(ErrorContext::new("IoError", "disk full", ""))
        } else {
            record
        }
    }

    fn any_severity() -> impl Strategy<Value = Severity> {
        prop::sample::select(Severity::ALL.to_vec())
    }

    mod destination_set_tests {
        use super::*;

        #[test]
        fn empty_set() {
            let set = DestinationSet::NONE;
            assert!(set.is_empty());
            assert_eq!(set.len(), 0);
            assert_eq!(set.iter().count(), 0);
        }

        #[test]
        fn iterates_channel_first() {
            let set = DestinationSet {
                channel: true,
                subscribers: true,
            };
            let order: Vec<_> = set.iter().collect();
            assert_eq!(order, vec![Destination::Channel, Destination::Subscribers]);
        }
    }

    mod classifier_tests {
        use super::*;

        #[test]
        fn below_threshold_is_dropped() {
            let classifier = Classifier::new(Severity::Warning, true);
            assert!(classifier.classify(&record(Severity::Info, true)).is_empty());
        }

        #[test]
        fn at_threshold_goes_to_channel() {
            let classifier = Classifier::new(Severity::Warning, true);
            let set = classifier.classify(&record(Severity::Warning, false));
            assert!(set.contains(Destination::Channel));
            assert!(!set.contains(Destination::Subscribers));
        }

        #[test]
        fn critical_without_error_context_is_channel_only() {
            let classifier = Classifier::new(Severity::Warning, true);
            let set = classifier.classify(&record(Severity::Critical, false));
            assert_eq!(set.len(), 1);
            assert!(set.contains(Destination::Channel));
        }

        #[test]
        fn error_context_adds_subscribers() {
            let classifier = Classifier::new(Severity::Warning, true);
            let set = classifier.classify(&record(Severity::Warning, true));
            assert!(set.contains(Destination::Channel));
            assert!(set.contains(Destination::Subscribers));
        }

        #[test]
        fn error_context_without_subscribers_is_channel_only() {
            let classifier = Classifier::new(Severity::Warning, false);
            let set = classifier.classify(&record(Severity::Critical, true));
            assert_eq!(set.iter().collect::<Vec<_>>(), vec![Destination::Channel]);
        }
    }

    proptest! {
        #[test]
        fn prop_below_threshold_produces_nothing(
            level in any_severity(),
            threshold in any_severity(),
            with_error in any::<bool>(),
            has_subscribers in any::<bool>()
        ) {
            prop_assume!(level < threshold);
            let classifier = Classifier::new(threshold, has_subscribers);
            prop_assert!(classifier.classify(&record(level, with_error)).is_empty());
        }

        #[test]
        fn prop_without_error_context_exactly_one_channel(
            level in any_severity(),
            threshold in any_severity(),
            has_subscribers in any::<bool>()
        ) {
            prop_assume!(level >= threshold);
            let classifier = Classifier::new(threshold, has_subscribers);
            let set = classifier.classify(&record(level, false));
            prop_assert_eq!(set.len(), 1);
            prop_assert!(set.contains(Destination::Channel));
        }

        #[test]
        fn prop_with_error_context_channel_and_subscribers(
            level in any_severity(),
            threshold in any_severity()
        ) {
            prop_assume!(level >= threshold);
            let classifier = Classifier::new(threshold, true);
            let set = classifier.classify(&record(level, true));
            prop_assert_eq!(set.len(), 2);
            prop_assert!(set.contains(Destination::Channel));
            prop_assert!(set.contains(Destination::Subscribers));
        }
    }
}
