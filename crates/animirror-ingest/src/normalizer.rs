use animirror_store::{
    EpisodeRow, TranslationRow, WorkRow, WorkStatus, WorkTranslationRow, episode_identity,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

const ALT_TITLE_KEYS: [&str; 5] = [
    "title_orig",
    "other_title",
    "other_titles",
    "other_titles_en",
    "other_titles_jp",
];

#[derive(Debug)]
pub enum NormalizeError {
    NotAnObject,
    MissingIdentity,
}

impl fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormalizeError::NotAnObject => write!(f, "raw item is not an object"),
            NormalizeError::MissingIdentity => {
                write!(f, "raw item has no id, kodik_id or link")
            }
        }
    }
}

impl std::error::Error for NormalizeError {}

#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    pub work: WorkRow,
    pub translation: TranslationRow,
    pub link: WorkTranslationRow,
    pub episodes: Vec<EpisodeRow>,
}

/// Turns one heterogeneous catalog record into the internal bundle. Pure:
/// the same input always yields the same bundle (set-like fields come back
/// sorted).
pub fn normalize(raw: &Value) -> Result<Bundle, NormalizeError> {
    if !raw.is_object() {
        return Err(NormalizeError::NotAnObject);
    }

    let work_id = ["id", "kodik_id", "link"]
        .iter()
        .find_map(|key| non_empty_str(raw.get(key)))
        .ok_or(NormalizeError::MissingIdentity)?;

    let translation_info = raw.get("translation").cloned().unwrap_or(Value::Null);
    let translation_id = as_i64_lossy(translation_info.get("id")).unwrap_or(0);
    let translation = TranslationRow {
        id: translation_id,
        title: non_empty_str(translation_info.get("title"))
            .unwrap_or_else(|| "unknown".to_string()),
        kind: non_empty_str(translation_info.get("type")),
    };

    let material = raw.get("material_data").cloned().unwrap_or(Value::Null);
    let additional = raw.get("additional_data").cloned().unwrap_or(Value::Null);

    let last_episode = as_i64_lossy(raw.get("last_episode")).map(|value| value as i32);
    let episodes_total = as_i64_lossy(additional.get("episodes_count"))
        .map(|value| value as i32)
        .or(last_episode)
        .or_else(|| as_i64_lossy(additional.get("last_episode")).map(|value| value as i32));

    let work = WorkRow {
        id: work_id.clone(),
        title: non_empty_str(raw.get("title")),
        title_orig: non_empty_str(raw.get("title_orig")),
        alt_titles: collect_alt_titles(&material),
        year: as_i64_lossy(raw.get("year")).map(|value| value as i32),
        poster_url: non_empty_str(material.get("poster_url"))
            .or_else(|| non_empty_str(material.get("anime_poster_url"))),
        description: non_empty_str(material.get("description"))
            .or_else(|| non_empty_str(material.get("anime_description"))),
        genres: sorted_string_set(
            material
                .get("genres")
                .or_else(|| material.get("anime_genres")),
        ),
        rating_shiki: as_f64_lossy(material.get("shikimori_rating")),
        rating_kinopoisk: as_f64_lossy(material.get("kinopoisk_rating")),
        rating_imdb: as_f64_lossy(material.get("imdb_rating")),
        episodes_total,
        external_ids: collect_external_ids(raw),
        blocked_countries: sorted_string_set(additional.get("blocked_countries")),
        status: map_status(
            non_empty_str(material.get("anime_status"))
                .or_else(|| non_empty_str(material.get("status")))
                .or_else(|| non_empty_str(raw.get("status"))),
        ),
    };

    let link = WorkTranslationRow {
        work_id: work_id.clone(),
        translation_id,
        episodes_available: as_i64_lossy(additional.get("episodes_count"))
            .map(|value| value as i32)
            .or(last_episode),
        last_episode,
    };

    let episodes = collect_episodes(raw, &work_id, translation_id, episodes_total);

    Ok(Bundle {
        work,
        translation,
        link,
        episodes,
    })
}

fn collect_episodes(
    raw: &Value,
    work_id: &str,
    translation_id: i64,
    episodes_total: Option<i32>,
) -> Vec<EpisodeRow> {
    // Last write wins on a duplicate (season, number); the map also gives
    // the bundle a stable episode order.
    let mut collected: BTreeMap<(i32, i32), EpisodeRow> = BTreeMap::new();

    if let Some(seasons) = raw.get("seasons").and_then(Value::as_object) {
        for (season_key, season_value) in seasons {
            let season = season_key.trim().parse::<i32>().unwrap_or(1);
            let mapping = season_value
                .get("episodes")
                .and_then(Value::as_object)
                .or_else(|| season_value.as_object());
            let Some(mapping) = mapping else {
                continue;
            };
            for (episode_key, episode_value) in mapping {
                // Only integer-parseable keys name episodes; anything else
                // in the season object is metadata.
                let Ok(number) = episode_key.trim().parse::<i32>() else {
                    continue;
                };
                let (title, duration, preview) = match episode_value {
                    Value::Object(data) => (
                        non_empty_str(data.get("title"))
                            .or_else(|| non_empty_str(data.get("name"))),
                        as_i64_lossy(data.get("duration")).map(|value| value as i32),
                        non_empty_str(data.get("preview")),
                    ),
                    _ => (None, None, None),
                };
                collected.insert(
                    (season, number),
                    EpisodeRow {
                        id: episode_identity(work_id, translation_id, number),
                        work_id: work_id.to_string(),
                        translation_id,
                        number,
                        season,
                        title,
                        duration,
                        preview_url: preview,
                    },
                );
            }
        }
    }

    if collected.is_empty() {
        if let Some(total) = episodes_total.filter(|total| *total > 0) {
            for number in 1..=total {
                collected.insert(
                    (1, number),
                    EpisodeRow {
                        id: episode_identity(work_id, translation_id, number),
                        work_id: work_id.to_string(),
                        translation_id,
                        number,
                        season: 1,
                        title: None,
                        duration: None,
                        preview_url: None,
                    },
                );
            }
        }
    }

    collected.into_values().collect()
}

fn collect_alt_titles(material: &Value) -> Vec<String> {
    let mut titles = BTreeSet::new();
    for key in ALT_TITLE_KEYS {
        match material.get(key) {
            Some(Value::Array(values)) => {
                for value in values {
                    if let Some(text) = non_empty_str(Some(value)) {
                        titles.insert(text);
                    }
                }
            }
            other => {
                if let Some(text) = non_empty_str(other) {
                    titles.insert(text);
                }
            }
        }
    }
    titles.into_iter().collect()
}

fn collect_external_ids(raw: &Value) -> BTreeMap<String, String> {
    let mut ids = BTreeMap::new();
    for (key, source) in [
        ("shikimori", "shikimori_id"),
        ("kinopoisk", "kinopoisk_id"),
        ("imdb", "imdb_id"),
    ] {
        match raw.get(source) {
            Some(Value::String(text)) if !text.trim().is_empty() => {
                ids.insert(key.to_string(), text.trim().to_string());
            }
            Some(Value::Number(number)) if number.as_i64() != Some(0) => {
                ids.insert(key.to_string(), number.to_string());
            }
            _ => {}
        }
    }
    ids
}

fn map_status(raw: Option<String>) -> Option<WorkStatus> {
    match raw?.to_lowercase().as_str() {
        "ongoing" | "airing" => Some(WorkStatus::Ongoing),
        "released" | "finished" => Some(WorkStatus::Released),
        "announced" => Some(WorkStatus::Announced),
        _ => None,
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        _ => None,
    }
}

fn as_i64_lossy(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn as_f64_lossy(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn sorted_string_set(value: Option<&Value>) -> Vec<String> {
    let mut out = BTreeSet::new();
    if let Some(Value::Array(values)) = value {
        for entry in values {
            if let Some(text) = non_empty_str(Some(entry)) {
                out.insert(text);
            }
        }
    }
    out.into_iter().collect()
}
