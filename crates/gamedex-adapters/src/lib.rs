//! Review-site adapter: turns a fetched game page into a [`GameRecord`].
//!
//! The page's embedded `application/ld+json` block is the primary source. Four
//! page regions (user score, critic review count, user rating count, developer)
//! are probed independently; each probe that comes back empty falls back to its
//! default instead of failing the record.

use chrono::NaiveDate;
use gamedex_core::{GameRecord, DEFAULT_GAMEPASS_STATUS, UNSPECIFIED_RATING};
use gamedex_storage::{fetch_with_retry, FetchExhaustedError, PageFetcher, RetryPolicy};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "gamedex-adapters";

pub const STRUCTURED_DATA_SELECTOR: &str = r#"script[type="application/ld+json"]"#;
pub const USER_SCORE_SELECTOR: &str = "div.user";
pub const CRITIC_COUNT_SELECTOR: &str = "span.count a";
pub const USER_SUMMARY_SELECTOR: &str = "div.summary";
pub const DEVELOPER_SELECTOR: &str = ".developer a";

pub const RELEASE_DATE_FORMAT: &str = "%B %d, %Y";
const RATING_PREFIX: &str = "ESRB ";
const USER_SCORE_PENDING: &str = "tbd";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionErrorKind {
    #[error("structured data block not found")]
    MissingStructuredData,
    #[error("structured data block is not valid JSON: {0}")]
    InvalidStructuredData(String),
    #[error("structured data has no name")]
    MissingName,
    #[error("structured data has no datePublished")]
    MissingReleaseDate,
    #[error("unparseable release date {0:?}")]
    InvalidReleaseDate(String),
    #[error("structured data has no image")]
    MissingImage,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("extracting {url}: {kind}")]
pub struct ExtractionError {
    pub url: String,
    pub kind: ExtractionErrorKind,
}

/// Fetches a game page through the retry loop. An attempt only counts as
/// successful once the body parses and carries a structured-data block.
pub async fn fetch_game_page<F>(
    fetcher: &F,
    url: &str,
    policy: &RetryPolicy,
) -> Result<Html, FetchExhaustedError>
where
    F: PageFetcher + ?Sized,
{
    fetch_with_retry(fetcher, url, policy, |body| {
        let document = Html::parse_document(body);
        structured_data_block(&document).map_err(|kind| kind.to_string())?;
        Ok(document)
    })
    .await
}

/// Locates and decodes the page's structured-data block.
pub fn structured_data_block(document: &Html) -> Result<JsonValue, ExtractionErrorKind> {
    let script = select_first(document, STRUCTURED_DATA_SELECTOR)
        .ok_or(ExtractionErrorKind::MissingStructuredData)?;
    let text = script.text().collect::<String>();
    let value: JsonValue = serde_json::from_str(text.trim())
        .map_err(|e| ExtractionErrorKind::InvalidStructuredData(e.to_string()))?;
    match value {
        JsonValue::Array(items) => items
            .into_iter()
            .find(JsonValue::is_object)
            .ok_or(ExtractionErrorKind::MissingStructuredData),
        other => Ok(other),
    }
}

pub fn extract_game_record(document: &Html, url: &str) -> Result<GameRecord, ExtractionError> {
    let fail = |kind| ExtractionError {
        url: url.to_string(),
        kind,
    };

    let data = structured_data_block(document).map_err(fail)?;

    let name = json_str(&data, &["name"])
        .and_then(text_or_none)
        .ok_or_else(|| fail(ExtractionErrorKind::MissingName))?;
    let date_text =
        json_str(&data, &["datePublished"]).ok_or_else(|| fail(ExtractionErrorKind::MissingReleaseDate))?;
    let release_date = parse_release_date(date_text)
        .ok_or_else(|| fail(ExtractionErrorKind::InvalidReleaseDate(date_text.to_string())))?;
    let image = image_reference(&data).ok_or_else(|| fail(ExtractionErrorKind::MissingImage))?;

    let maturity_rating = normalize_maturity_rating(json_str(&data, &["contentRating"]));
    let genre = join_names(data.get("genre"));
    let platform = json_str(&data, &["gamePlatform"]).and_then(text_or_none);
    let publisher = join_names(data.get("publisher"));
    let meta_score = json_at(&data, &["aggregateRating", "ratingValue"]).and_then(json_integer);
    let summary = json_str(&data, &["description"]).and_then(text_or_none);

    let user_score = user_score(document);
    let critic_review_count = critic_review_count(document).unwrap_or_else(|| {
        debug!(url, "critic review count unavailable, defaulting to 0");
        0
    });
    let user_rating_count = user_rating_count(document).unwrap_or_else(|| {
        debug!(url, "user rating count unavailable, defaulting to 0");
        0
    });
    let developer = developer(document);
    if developer.is_none() {
        debug!(url, "developer unavailable");
    }

    Ok(GameRecord {
        name,
        release_date,
        maturity_rating,
        genre,
        platform,
        developer,
        publisher,
        meta_score,
        critic_review_count,
        user_score,
        user_rating_count,
        summary,
        image,
        gamepass_status: DEFAULT_GAMEPASS_STATUS.to_string(),
    })
}

pub fn parse_release_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), RELEASE_DATE_FORMAT).ok()
}

pub fn normalize_maturity_rating(raw: Option<&str>) -> String {
    raw.unwrap_or(UNSPECIFIED_RATING).replace(RATING_PREFIX, "")
}

/// User score region. `"tbd"` and anything non-numeric map to `None`.
pub fn user_score(document: &Html) -> Option<f64> {
    let text = select_first_text(document, USER_SCORE_SELECTOR)?;
    if text.eq_ignore_ascii_case(USER_SCORE_PENDING) {
        return None;
    }
    text.parse().ok()
}

pub fn critic_review_count(document: &Html) -> Option<i64> {
    select_first_text(document, CRITIC_COUNT_SELECTOR).and_then(|t| leading_count(&t))
}

/// The user rating count sits in the first link of the second summary block.
pub fn user_rating_count(document: &Html) -> Option<i64> {
    let summary_sel = Selector::parse(USER_SUMMARY_SELECTOR).ok()?;
    let link_sel = Selector::parse("a").ok()?;
    let summary = document.select(&summary_sel).nth(1)?;
    let link = summary.select(&link_sel).next()?;
    let text = text_or_none(&link.text().collect::<String>())?;
    leading_count(&text)
}

pub fn developer(document: &Html) -> Option<String> {
    select_first_text(document, DEVELOPER_SELECTOR)
}

fn select_first<'a>(document: &'a Html, selector: &str) -> Option<ElementRef<'a>> {
    let sel = Selector::parse(selector).ok()?;
    document.select(&sel).next()
}

fn select_first_text(document: &Html, selector: &str) -> Option<String> {
    select_first(document, selector).and_then(|n| text_or_none(&n.text().collect::<String>()))
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// First whitespace-separated token as an integer ("42 Critics" -> 42).
fn leading_count(text: &str) -> Option<i64> {
    text.split_whitespace().next()?.replace(',', "").parse().ok()
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

fn json_integer(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn image_reference(data: &JsonValue) -> Option<String> {
    match data.get("image")? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Object(_) => json_str(data, &["image", "url"]).and_then(text_or_none),
        JsonValue::Array(items) => items.iter().find_map(JsonValue::as_str).and_then(text_or_none),
        _ => None,
    }
}

/// Joins a list of names with `", "`. Entries may be bare strings or objects
/// carrying a `name`; a single string or object is treated as a one-item list.
fn join_names(value: Option<&JsonValue>) -> String {
    fn entry_name(v: &JsonValue) -> Option<&str> {
        match v {
            JsonValue::String(s) => Some(s.as_str()),
            JsonValue::Object(_) => v.get("name").and_then(JsonValue::as_str),
            _ => None,
        }
    }

    match value {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(entry_name)
            .collect::<Vec<_>>()
            .join(", "),
        Some(single) => entry_name(single).unwrap_or_default().to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gamedex_storage::{AttemptError, FetchError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const URL: &str = "https://www.metacritic.com/game/xbox-series-x/halo-infinite";

    const FULL_LD: &str = r#"{
        "@type": "VideoGame",
        "name": "Halo Infinite",
        "datePublished": "December 8, 2021",
        "contentRating": "ESRB T",
        "genre": ["Action", "Shooter", "First-Person"],
        "gamePlatform": "Xbox Series X",
        "publisher": [{"@type": "Organization", "name": "Xbox Game Studios"}],
        "aggregateRating": {"@type": "AggregateRating", "ratingValue": "87"},
        "description": "The legendary Halo series returns.",
        "image": "https://static.metacritic.com/images/products/games/halo.jpg"
    }"#;

    const PROBES: &str = r#"
        <div class="details main_details"><span class="count"><a href="/critic-reviews">47 Critic Reviews</a></span></div>
        <div class="summary"><p>Metascore</p></div>
        <div class="summary"><a href="/user-reviews">1,234 Ratings</a></div>
        <div class="metascore_w user large">6.8</div>
        <li class="summary_detail developer"><a href="/company/343">343 Industries</a></li>
    "#;

    fn page(ld_json: &str, body: &str) -> Html {
        Html::parse_document(&format!(
            r#"<html><head><script type="application/ld+json">{ld_json}</script></head><body>{body}</body></html>"#
        ))
    }

    fn ld_without(key: &str) -> String {
        let mut value: JsonValue = serde_json::from_str(FULL_LD).unwrap();
        value.as_object_mut().unwrap().remove(key);
        value.to_string()
    }

    #[test]
    fn extracts_all_fields_from_a_complete_page() {
        let rec = extract_game_record(&page(FULL_LD, PROBES), URL).unwrap();
        assert_eq!(rec.name, "Halo Infinite");
        assert_eq!(rec.release_date, NaiveDate::from_ymd_opt(2021, 12, 8).unwrap());
        assert_eq!(rec.maturity_rating, "T");
        assert_eq!(rec.genre, "Action, Shooter, First-Person");
        assert_eq!(rec.platform.as_deref(), Some("Xbox Series X"));
        assert_eq!(rec.publisher, "Xbox Game Studios");
        assert_eq!(rec.meta_score, Some(87));
        assert_eq!(rec.critic_review_count, 47);
        assert_eq!(rec.user_score, Some(6.8));
        assert_eq!(rec.user_rating_count, 1234);
        assert_eq!(rec.developer.as_deref(), Some("343 Industries"));
        assert_eq!(rec.summary.as_deref(), Some("The legendary Halo series returns."));
        assert!(rec.image.ends_with("halo.jpg"));
        assert_eq!(rec.gamepass_status, DEFAULT_GAMEPASS_STATUS);
    }

    #[test]
    fn unreadable_optional_regions_degrade_to_defaults() {
        let rec = extract_game_record(&page(FULL_LD, "<p>nothing here</p>"), URL).unwrap();
        assert_eq!(rec.user_score, None);
        assert_eq!(rec.critic_review_count, 0);
        assert_eq!(rec.user_rating_count, 0);
        assert_eq!(rec.developer, None);
    }

    #[test]
    fn malformed_optional_regions_degrade_to_defaults() {
        let body = r#"
            <span class="count"><a>many reviews</a></span>
            <div class="summary"><a>only one summary block</a></div>
            <div class="user">not a number</div>
            <div class="developer">no link</div>
        "#;
        let rec = extract_game_record(&page(FULL_LD, body), URL).unwrap();
        assert_eq!(rec.user_score, None);
        assert_eq!(rec.critic_review_count, 0);
        assert_eq!(rec.user_rating_count, 0);
        assert_eq!(rec.developer, None);
    }

    #[test]
    fn tbd_user_score_is_null() {
        let rec = extract_game_record(&page(FULL_LD, r#"<div class="user">tbd</div>"#), URL).unwrap();
        assert_eq!(rec.user_score, None);
    }

    #[test]
    fn maturity_rating_prefix_is_stripped_and_defaulted() {
        assert_eq!(normalize_maturity_rating(Some("ESRB M")), "M");
        assert_eq!(normalize_maturity_rating(None), "Unspecified");

        let rec = extract_game_record(&page(&ld_without("contentRating"), ""), URL).unwrap();
        assert_eq!(rec.maturity_rating, "Unspecified");
    }

    #[test]
    fn missing_aggregate_rating_gives_null_meta_score() {
        let rec = extract_game_record(&page(&ld_without("aggregateRating"), ""), URL).unwrap();
        assert_eq!(rec.meta_score, None);
    }

    #[test]
    fn missing_image_fails_the_record() {
        let err = extract_game_record(&page(&ld_without("image"), PROBES), URL).unwrap_err();
        assert_eq!(err.kind, ExtractionErrorKind::MissingImage);
        assert_eq!(err.url, URL);
    }

    #[test]
    fn missing_structured_data_fails_the_record() {
        let doc = Html::parse_document("<html><body><h1>Halo</h1></body></html>");
        let err = extract_game_record(&doc, URL).unwrap_err();
        assert_eq!(err.kind, ExtractionErrorKind::MissingStructuredData);
    }

    #[test]
    fn unparseable_release_date_fails_the_record() {
        let ld = FULL_LD.replace("December 8, 2021", "TBA 2025");
        let err = extract_game_record(&page(&ld, ""), URL).unwrap_err();
        assert_eq!(
            err.kind,
            ExtractionErrorKind::InvalidReleaseDate("TBA 2025".to_string())
        );
        let err = extract_game_record(&page(&ld_without("datePublished"), ""), URL).unwrap_err();
        assert_eq!(err.kind, ExtractionErrorKind::MissingReleaseDate);
    }

    #[test]
    fn image_and_names_accept_alternate_shapes() {
        let ld = r#"{
            "name": "Forza Horizon 5",
            "datePublished": "November 9, 2021",
            "genre": "Racing",
            "publisher": ["Xbox Game Studios", {"name": "Microsoft"}],
            "image": {"@type": "ImageObject", "url": "https://img.test/fh5.jpg"}
        }"#;
        let rec = extract_game_record(&page(ld, ""), URL).unwrap();
        assert_eq!(rec.genre, "Racing");
        assert_eq!(rec.publisher, "Xbox Game Studios, Microsoft");
        assert_eq!(rec.image, "https://img.test/fh5.jpg");
        assert_eq!(rec.platform, None);
    }

    struct CountingFetcher {
        bodies: Vec<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PageFetcher for CountingFetcher {
        async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.bodies.get(call) {
                Some(body) => Ok(body.to_string()),
                None => Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }

    fn instant_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn page_without_structured_data_is_refetched() {
        let good: &'static str = Box::leak(
            format!(
                r#"<html><head><script type="application/ld+json">{FULL_LD}</script></head></html>"#
            )
            .into_boxed_str(),
        );
        let fetcher = CountingFetcher {
            bodies: vec!["<html><body>Please wait...</body></html>", good],
            calls: AtomicUsize::new(0),
        };

        let doc = fetch_game_page(&fetcher, URL, &instant_retry()).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(extract_game_record(&doc, URL).unwrap().name, "Halo Infinite");
    }

    #[tokio::test]
    async fn exhausted_fetch_reports_last_parse_error() {
        let fetcher = CountingFetcher {
            bodies: vec!["<html></html>"; 3],
            calls: AtomicUsize::new(0),
        };
        let err = fetch_game_page(&fetcher, URL, &instant_retry()).await.unwrap_err();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err.last_error, AttemptError::Parse(ref msg) if msg.contains("structured data")));
    }
}
