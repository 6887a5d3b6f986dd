//! Content/subscriber state machine
//!
//! Computes link statuses when a subscriber first becomes linked to an item, keeps a
//! subscriber's links in line with its subscriptions, classifies discovered titles into
//! series, and derives an item's pipeline position.

use crate::config::SeriesConfig;
use crate::db::{Database, Item, Link};
use crate::error::{Error, Result};
use crate::types::{ItemState, LinkStatus, SubscriberId};
use chrono::NaiveDate;
use regex::{Regex, RegexBuilder};

/// Initial status of a new link
///
/// The date check comes first: an item published before the subscription started is
/// recorded as already distributed and is never sent.
pub fn assign_status(
    subscribed_since: NaiveDate,
    publication_date: NaiveDate,
    byte_size: i64,
) -> LinkStatus {
    if subscribed_since > publication_date {
        LinkStatus::Distributed
    } else if byte_size > 0 {
        LinkStatus::Downloaded
    } else {
        LinkStatus::Pending
    }
}

/// Links created and removed by one reconciliation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReconcileReport {
    /// Links deleted because their series is no longer subscribed
    pub removed: u64,
    /// Links created for subscribed items that had none
    pub created: u64,
}

/// Bring a subscriber's links in line with its current subscriptions
///
/// Deletes links to items of unsubscribed series, then links every item of each
/// subscribed series that has no link yet. Running it again changes nothing.
pub async fn check_subscriptions(db: &Database, subscriber_id: SubscriberId) -> Result<ReconcileReport> {
    if db.get_subscriber(subscriber_id).await?.is_none() {
        return Err(Error::Validation(format!(
            "subscriber {} does not exist",
            subscriber_id
        )));
    }

    let subscriptions = db.subscriptions(subscriber_id).await?;
    let series: Vec<String> = subscriptions.iter().map(|s| s.series.clone()).collect();

    let mut report = ReconcileReport {
        removed: db.delete_links_outside_series(subscriber_id, &series).await?,
        created: 0,
    };

    for subscription in &subscriptions {
        // The listing only picks candidates; each link is classified from the
        // item row as it stands when the link is written
        for item in db.unlinked_items(subscriber_id, &subscription.series).await? {
            if db
                .link_item(subscriber_id, item.id, subscription.subscribed_since)
                .await?
                .is_some()
            {
                report.created += 1;
            }
        }
    }

    if report != ReconcileReport::default() {
        tracing::info!(
            subscriber_id = %subscriber_id,
            removed = report.removed,
            created = report.created,
            "Reconciled subscriber links"
        );
    }
    Ok(report)
}

/// Link a newly discovered item to every subscriber of its series
///
/// Returns the number of links created.
pub async fn link_new_item(db: &Database, item: &Item) -> Result<u64> {
    let mut created = 0;
    for subscription in db.subscriptions_for_series(&item.series).await? {
        if db
            .link_item(subscription.subscriber_id, item.id, subscription.subscribed_since)
            .await?
            .is_some()
        {
            created += 1;
        }
    }
    Ok(created)
}

/// Maps discovered titles onto configured series by regex
pub struct SeriesClassifier {
    rules: Vec<(String, Regex)>,
}

impl SeriesClassifier {
    /// Compile the title patterns of `series`; entries without a pattern are skipped
    pub fn new(series: &[SeriesConfig]) -> Result<Self> {
        let rules = series
            .iter()
            .filter_map(|s| s.title_pattern.as_ref().map(|p| (s, p)))
            .map(|(s, pattern)| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|re| (s.name.clone(), re))
                    .map_err(|e| {
                        Error::config(
                            format!("invalid title pattern for series '{}': {}", s.name, e),
                            "series.title_pattern",
                        )
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// First series whose pattern matches `title`
    pub fn classify(&self, title: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|(_, re)| re.is_match(title))
            .map(|(name, _)| name.as_str())
    }
}

impl ItemState {
    /// Position of an item given its row (if any) and its links
    pub fn derive(item: Option<&Item>, links: &[Link]) -> ItemState {
        let Some(item) = item else {
            return ItemState::Undiscovered;
        };
        if item.is_downloaded() {
            if !links.is_empty() && links.iter().all(|l| l.status == LinkStatus::Distributed) {
                ItemState::Distributed
            } else {
                ItemState::Downloaded
            }
        } else if item.is_resolved() {
            ItemState::DetailResolved
        } else {
            ItemState::Discovered
        }
    }
}
