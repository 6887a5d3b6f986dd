
use crate::db::{Database, Item};
use chrono::NaiveDate;

pub(super) fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Insert an item in `series` published on `published`
pub(super) async fn item(db: &Database, detail_ref: &str, series: &str, published: NaiveDate) -> Item {
    let (item, created) = db
        .upsert_item(&format!("Issue {}", detail_ref), series, published, detail_ref)
        .await
        .unwrap();
    assert!(created);
    item
}
