use std::fs;
use std::path::{Path, PathBuf};

use gamedex_adapters::extract_game_record;
use gamedex_core::GameRecord;
use scraper::Html;

fn fixture_dir(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/metacritic")
        .join(name)
}

#[test]
fn golden_snapshot_halo_infinite() {
    let dir = fixture_dir("halo-infinite");
    let html = fs::read_to_string(dir.join("page.html")).expect("read page fixture");
    let expected: GameRecord = serde_json::from_str(
        &fs::read_to_string(dir.join("snapshot.json")).expect("read snapshot"),
    )
    .expect("parse snapshot");

    let document = Html::parse_document(&html);
    let actual = extract_game_record(
        &document,
        "https://www.metacritic.com/game/xbox-series-x/halo-infinite",
    )
    .expect("fixture page extracts");

    assert_eq!(actual, expected);
}
