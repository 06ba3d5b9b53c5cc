//! Core domain model for scraped game metadata.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "gamedex-core";

/// Status assigned when a title has no accepted match in the availability table.
pub const DEFAULT_GAMEPASS_STATUS: &str = "Not Included";

/// Maturity rating used when the page carries no content rating.
pub const UNSPECIFIED_RATING: &str = "Unspecified";

/// Output column names, in schema order.
pub mod columns {
    pub const NAME: &str = "Name";
    pub const RELEASE_DATE: &str = "Release Date";
    pub const MATURITY_RATING: &str = "Maturity Rating";
    pub const GENRE: &str = "Genre";
    pub const PLATFORM: &str = "Platform";
    pub const DEVELOPER: &str = "Developer";
    pub const PUBLISHER: &str = "Publisher";
    pub const META_SCORE: &str = "Meta Score";
    pub const CRITIC_REVIEWS_COUNT: &str = "Critic Reviews Count";
    pub const USER_SCORE: &str = "User Score";
    pub const USER_RATING_COUNT: &str = "User Rating Count";
    pub const SUMMARY: &str = "Summary";
    pub const IMAGE: &str = "Image";
    pub const GAMEPASS_STATUS: &str = "Gamepass_Status";
}

/// One scraped title.
///
/// `name` and `image` are always present on a successfully extracted record;
/// every other field falls back to a default instead of failing the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRecord {
    pub name: String,
    pub release_date: NaiveDate,
    pub maturity_rating: String,
    pub genre: String,
    pub platform: Option<String>,
    pub developer: Option<String>,
    pub publisher: String,
    pub meta_score: Option<i64>,
    pub critic_review_count: i64,
    pub user_score: Option<f64>,
    pub user_rating_count: i64,
    pub summary: Option<String>,
    pub image: String,
    #[serde(default = "default_gamepass_status")]
    pub gamepass_status: String,
}

fn default_gamepass_status() -> String {
    DEFAULT_GAMEPASS_STATUS.to_string()
}

impl GameRecord {
    pub fn with_gamepass_status(mut self, status: impl Into<String>) -> Self {
        self.gamepass_status = status.into();
        self
    }
}

/// Diagnostics entry for an item that could not be turned into a [`GameRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub url: String,
    pub error: String,
}

impl ExceptionRecord {
    pub fn new(url: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        let url = url.into();
        let error = format!("On game link {url}, Error : {cause}");
        Self { url, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_record_carries_url_and_cause() {
        let rec = ExceptionRecord::new("https://example.test/game/a", "missing image");
        assert_eq!(rec.url, "https://example.test/game/a");
        assert_eq!(
            rec.error,
            "On game link https://example.test/game/a, Error : missing image"
        );
    }

    #[test]
    fn gamepass_status_defaults_when_absent_from_json() {
        let json = r#"{
            "name": "Halo Infinite",
            "release_date": "2021-12-08",
            "maturity_rating": "T",
            "genre": "Action",
            "platform": "Xbox Series X",
            "developer": null,
            "publisher": "Xbox Game Studios",
            "meta_score": 87,
            "critic_review_count": 0,
            "user_score": null,
            "user_rating_count": 0,
            "summary": null,
            "image": "https://img.test/halo.jpg"
        }"#;
        let rec: GameRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.gamepass_status, DEFAULT_GAMEPASS_STATUS);
        let rec = rec.with_gamepass_status("Active");
        assert_eq!(rec.gamepass_status, "Active");
    }
}
