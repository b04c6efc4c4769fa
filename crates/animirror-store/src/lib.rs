use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{FromRow, PgConnection, PgPool};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

#[derive(Debug)]
pub enum StoreError {
    Sql(sqlx::Error),
    Constraint(String),
    InvalidInput(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Sql(err) => write!(f, "database error: {}", err),
            StoreError::Constraint(message) => write!(f, "constraint violation: {}", message),
            StoreError::InvalidInput(message) => write!(f, "invalid input: {}", message),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        // CHECK violations are data bugs, not infrastructure failures;
        // surface them as validation errors so callers count them as such.
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some("23514") {
                return StoreError::Constraint(db_err.message().to_string());
            }
        }
        StoreError::Sql(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    Ongoing,
    Released,
    Announced,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Ongoing => "ongoing",
            WorkStatus::Released => "released",
            WorkStatus::Announced => "announced",
        }
    }

    pub fn parse(raw: &str) -> Option<WorkStatus> {
        match raw {
            "ongoing" => Some(WorkStatus::Ongoing),
            "released" => Some(WorkStatus::Released),
            "announced" => Some(WorkStatus::Announced),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkRow {
    pub id: String,
    pub title: Option<String>,
    pub title_orig: Option<String>,
    pub alt_titles: Vec<String>,
    pub year: Option<i32>,
    pub poster_url: Option<String>,
    pub description: Option<String>,
    pub genres: Vec<String>,
    pub rating_shiki: Option<f64>,
    pub rating_kinopoisk: Option<f64>,
    pub rating_imdb: Option<f64>,
    pub episodes_total: Option<i32>,
    pub external_ids: BTreeMap<String, String>,
    pub blocked_countries: Vec<String>,
    pub status: Option<WorkStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslationRow {
    pub id: i64,
    pub title: String,
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkTranslationRow {
    pub work_id: String,
    pub translation_id: i64,
    pub episodes_available: Option<i32>,
    pub last_episode: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeRow {
    pub id: String,
    pub work_id: String,
    pub translation_id: i64,
    pub number: i32,
    pub season: i32,
    pub title: Option<String>,
    pub duration: Option<i32>,
    pub preview_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MediaRow {
    pub episode_id: String,
    pub telegram_chat_id: String,
    pub telegram_message_id: i64,
    pub file_unique_id: Option<String>,
    pub quality: Option<i32>,
    pub source_url: Option<String>,
    pub checksum: Option<String>,
    pub size_bytes: Option<i64>,
}

/// An episode awaiting publish, joined with the owning work so the caller
/// can reach external ids without a second query.
#[derive(Debug, Clone, FromRow)]
pub struct PendingEpisode {
    pub id: String,
    pub work_id: String,
    pub translation_id: i64,
    pub number: i32,
    pub season: i32,
    pub work_title: Option<String>,
    pub external_ids: Value,
}

#[derive(Debug, FromRow)]
pub struct WorkRecord {
    pub id: String,
    pub title: Option<String>,
    pub title_orig: Option<String>,
    pub alt_titles: Value,
    pub year: Option<i32>,
    pub poster_url: Option<String>,
    pub description: Option<String>,
    pub genres: Value,
    pub rating_shiki: Option<f64>,
    pub rating_kinopoisk: Option<f64>,
    pub rating_imdb: Option<f64>,
    pub episodes_total: Option<i32>,
    pub external_ids: Value,
    pub blocked_countries: Value,
    pub status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow, Serialize)]
pub struct SearchItem {
    pub id: String,
    pub title: Option<String>,
    pub year: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct UserProfile {
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
    pub is_premium: bool,
    pub geo: Option<String>,
}

pub async fn init_store(db: &PgPool) -> Result<(), StoreError> {
    // Trigram similarity powers title search ordering; creating the
    // extension needs elevated rights, so a failure only degrades ranking.
    if let Err(err) = sqlx::query("CREATE EXTENSION IF NOT EXISTS pg_trgm")
        .execute(db)
        .await
    {
        warn!("pg_trgm unavailable, title similarity ranking degraded: {}", err);
    }

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS work ( \
            id TEXT PRIMARY KEY, \
            title TEXT, \
            title_orig TEXT, \
            alt_titles JSONB NOT NULL DEFAULT '[]', \
            year INTEGER, \
            poster_url TEXT, \
            description TEXT, \
            genres JSONB NOT NULL DEFAULT '[]', \
            rating_shiki DOUBLE PRECISION, \
            rating_kinopoisk DOUBLE PRECISION, \
            rating_imdb DOUBLE PRECISION, \
            episodes_total INTEGER, \
            external_ids JSONB NOT NULL DEFAULT '{}', \
            blocked_countries JSONB NOT NULL DEFAULT '[]', \
            status TEXT, \
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
            CONSTRAINT ck_work_status CHECK ( \
                status IS NULL OR status IN ('ongoing', 'released', 'announced') \
            ) \
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS translation ( \
            id BIGINT PRIMARY KEY, \
            title TEXT NOT NULL, \
            type TEXT \
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS work_translation ( \
            work_id TEXT NOT NULL REFERENCES work(id) ON DELETE CASCADE, \
            translation_id BIGINT NOT NULL REFERENCES translation(id) ON DELETE CASCADE, \
            episodes_available INTEGER DEFAULT 0, \
            last_episode INTEGER, \
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
            PRIMARY KEY (work_id, translation_id) \
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS episode ( \
            id TEXT PRIMARY KEY, \
            work_id TEXT NOT NULL REFERENCES work(id) ON DELETE CASCADE, \
            translation_id BIGINT NOT NULL REFERENCES translation(id) ON DELETE CASCADE, \
            number INTEGER NOT NULL, \
            season INTEGER NOT NULL DEFAULT 1, \
            title TEXT, \
            duration INTEGER, \
            preview_url TEXT, \
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
            CONSTRAINT uq_episode_number UNIQUE (work_id, translation_id, number), \
            CONSTRAINT ck_episode_number_positive CHECK (number > 0), \
            CONSTRAINT ck_episode_season_positive CHECK (season > 0), \
            CONSTRAINT ck_episode_duration CHECK (duration IS NULL OR duration >= 0) \
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS episode_media ( \
            episode_id TEXT PRIMARY KEY REFERENCES episode(id) ON DELETE CASCADE, \
            telegram_chat_id TEXT NOT NULL, \
            telegram_message_id BIGINT NOT NULL, \
            file_unique_id TEXT, \
            quality INTEGER, \
            source_url TEXT, \
            checksum TEXT, \
            size_bytes BIGINT, \
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
            CONSTRAINT ck_media_quality CHECK (quality IS NULL OR quality > 0), \
            CONSTRAINT ck_media_size CHECK (size_bytes IS NULL OR size_bytes > 0) \
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS app_user ( \
            id BIGINT PRIMARY KEY, \
            username TEXT, \
            first_name TEXT, \
            last_name TEXT, \
            language_code TEXT, \
            is_premium BOOLEAN NOT NULL DEFAULT FALSE, \
            geo TEXT, \
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
            last_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
            banned_at TIMESTAMPTZ, \
            is_admin BOOLEAN NOT NULL DEFAULT FALSE \
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS favorite ( \
            user_id BIGINT NOT NULL REFERENCES app_user(id) ON DELETE CASCADE, \
            work_id TEXT NOT NULL REFERENCES work(id) ON DELETE CASCADE, \
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
            PRIMARY KEY (user_id, work_id) \
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS rating ( \
            user_id BIGINT NOT NULL REFERENCES app_user(id) ON DELETE CASCADE, \
            work_id TEXT NOT NULL REFERENCES work(id) ON DELETE CASCADE, \
            score INTEGER NOT NULL, \
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
            PRIMARY KEY (user_id, work_id), \
            CONSTRAINT ck_rating_score_range CHECK (score >= 1 AND score <= 10) \
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS watch_history ( \
            user_id BIGINT NOT NULL REFERENCES app_user(id) ON DELETE CASCADE, \
            episode_id TEXT NOT NULL REFERENCES episode(id) ON DELETE CASCADE, \
            watched_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
            progress_seconds INTEGER NOT NULL DEFAULT 0, \
            completed BOOLEAN NOT NULL DEFAULT FALSE, \
            PRIMARY KEY (user_id, episode_id), \
            CONSTRAINT ck_watch_progress CHECK (progress_seconds >= 0) \
        )",
    )
    .execute(db)
    .await?;

    init_indexes(db).await?;
    Ok(())
}

async fn init_indexes(db: &PgPool) -> Result<(), StoreError> {
    let statements = [
        "CREATE INDEX IF NOT EXISTS ix_work_title ON work (title)",
        "CREATE INDEX IF NOT EXISTS ix_work_title_orig ON work (title_orig)",
        "CREATE INDEX IF NOT EXISTS ix_work_year ON work (year)",
        "CREATE INDEX IF NOT EXISTS ix_work_status ON work (status)",
        "CREATE INDEX IF NOT EXISTS ix_work_updated_at ON work (updated_at)",
        "CREATE INDEX IF NOT EXISTS ix_work_alt_titles_gin ON work USING GIN (alt_titles)",
        "CREATE INDEX IF NOT EXISTS ix_work_genres_gin ON work USING GIN (genres)",
        "CREATE INDEX IF NOT EXISTS ix_work_year_rating ON work (year, rating_shiki) \
         WHERE rating_shiki IS NOT NULL",
        "CREATE INDEX IF NOT EXISTS ix_translation_type ON translation (type)",
        "CREATE INDEX IF NOT EXISTS ix_work_translation_translation_id \
         ON work_translation (translation_id)",
        "CREATE INDEX IF NOT EXISTS ix_work_translation_updated_at \
         ON work_translation (updated_at)",
        "CREATE INDEX IF NOT EXISTS ix_episode_work_translation \
         ON episode (work_id, translation_id)",
        "CREATE INDEX IF NOT EXISTS ix_episode_translation_number \
         ON episode (translation_id, number)",
        "CREATE INDEX IF NOT EXISTS ix_episode_updated_at ON episode (updated_at)",
        "CREATE INDEX IF NOT EXISTS ix_episode_media_chat_message \
         ON episode_media (telegram_chat_id, telegram_message_id)",
        "CREATE INDEX IF NOT EXISTS ix_episode_media_file_unique_id \
         ON episode_media (file_unique_id)",
        "CREATE INDEX IF NOT EXISTS ix_favorite_work_id ON favorite (work_id)",
        "CREATE INDEX IF NOT EXISTS ix_rating_work_id ON rating (work_id)",
        "CREATE INDEX IF NOT EXISTS ix_watch_history_episode_id \
         ON watch_history (episode_id)",
    ];
    for statement in statements {
        sqlx::query(statement).execute(db).await?;
    }

    // gin_trgm_ops needs the extension; skip the index when it is absent.
    if let Err(err) = sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_work_title_trgm \
         ON work USING GIN (title gin_trgm_ops)",
    )
    .execute(db)
    .await
    {
        warn!("trigram index skipped: {}", err);
    }

    Ok(())
}

pub async fn upsert_work(conn: &mut PgConnection, work: &WorkRow) -> Result<(), StoreError> {
    if work.id.trim().is_empty() {
        return Err(StoreError::InvalidInput("work requires an id".to_string()));
    }

    sqlx::query(
        "INSERT INTO work ( \
            id, title, title_orig, alt_titles, year, poster_url, description, genres, \
            rating_shiki, rating_kinopoisk, rating_imdb, episodes_total, external_ids, \
            blocked_countries, status \
        ) VALUES ( \
            $1, $2, $3, $4, $5, $6, $7, $8, \
            $9, $10, $11, $12, $13, \
            $14, $15 \
        ) ON CONFLICT (id) DO UPDATE SET \
            title = EXCLUDED.title, \
            title_orig = EXCLUDED.title_orig, \
            alt_titles = EXCLUDED.alt_titles, \
            year = EXCLUDED.year, \
            poster_url = EXCLUDED.poster_url, \
            description = EXCLUDED.description, \
            genres = EXCLUDED.genres, \
            rating_shiki = EXCLUDED.rating_shiki, \
            rating_kinopoisk = EXCLUDED.rating_kinopoisk, \
            rating_imdb = EXCLUDED.rating_imdb, \
            episodes_total = EXCLUDED.episodes_total, \
            external_ids = EXCLUDED.external_ids, \
            blocked_countries = EXCLUDED.blocked_countries, \
            status = EXCLUDED.status, \
            updated_at = NOW()",
    )
    .bind(&work.id)
    .bind(work.title.as_deref())
    .bind(work.title_orig.as_deref())
    .bind(sqlx::types::Json(&work.alt_titles))
    .bind(work.year)
    .bind(work.poster_url.as_deref())
    .bind(work.description.as_deref())
    .bind(sqlx::types::Json(&work.genres))
    .bind(work.rating_shiki)
    .bind(work.rating_kinopoisk)
    .bind(work.rating_imdb)
    .bind(work.episodes_total)
    .bind(sqlx::types::Json(&work.external_ids))
    .bind(sqlx::types::Json(&work.blocked_countries))
    .bind(work.status.map(|status| status.as_str()))
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn upsert_works_batch(
    conn: &mut PgConnection,
    works: &[WorkRow],
) -> Result<usize, StoreError> {
    if works.is_empty() {
        return Ok(0);
    }
    let mut written = 0;
    for work in works {
        if work.id.trim().is_empty() {
            warn!("dropping work row without identity");
            continue;
        }
        upsert_work(conn, work).await?;
        written += 1;
    }
    Ok(written)
}

pub async fn upsert_translation(
    conn: &mut PgConnection,
    translation: &TranslationRow,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO translation (id, title, type) \
        VALUES ($1, $2, $3) \
        ON CONFLICT (id) DO UPDATE SET \
            title = EXCLUDED.title, \
            type = EXCLUDED.type",
    )
    .bind(translation.id)
    .bind(&translation.title)
    .bind(translation.kind.as_deref())
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn upsert_translations_batch(
    conn: &mut PgConnection,
    translations: &[TranslationRow],
) -> Result<usize, StoreError> {
    if translations.is_empty() {
        return Ok(0);
    }
    let mut written = 0;
    for translation in translations {
        if translation.id < 0 {
            warn!(translation_id = translation.id, "dropping translation row with negative id");
            continue;
        }
        upsert_translation(conn, translation).await?;
        written += 1;
    }
    Ok(written)
}

pub async fn upsert_work_translation(
    conn: &mut PgConnection,
    link: &WorkTranslationRow,
) -> Result<(), StoreError> {
    if link.work_id.trim().is_empty() {
        return Err(StoreError::InvalidInput(
            "work_translation requires work_id".to_string(),
        ));
    }

    sqlx::query(
        "INSERT INTO work_translation (work_id, translation_id, episodes_available, last_episode) \
        VALUES ($1, $2, $3, $4) \
        ON CONFLICT (work_id, translation_id) DO UPDATE SET \
            episodes_available = EXCLUDED.episodes_available, \
            last_episode = EXCLUDED.last_episode, \
            updated_at = NOW()",
    )
    .bind(&link.work_id)
    .bind(link.translation_id)
    .bind(link.episodes_available)
    .bind(link.last_episode)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn upsert_work_translations_batch(
    conn: &mut PgConnection,
    links: &[WorkTranslationRow],
) -> Result<usize, StoreError> {
    if links.is_empty() {
        return Ok(0);
    }
    let mut written = 0;
    for link in links {
        if link.work_id.trim().is_empty() {
            warn!("dropping work_translation row without work id");
            continue;
        }
        upsert_work_translation(conn, link).await?;
        written += 1;
    }
    Ok(written)
}

pub async fn upsert_episodes(
    conn: &mut PgConnection,
    episodes: &[EpisodeRow],
) -> Result<usize, StoreError> {
    if episodes.is_empty() {
        return Ok(0);
    }

    let mut written = 0;
    for episode in episodes {
        if episode.id.trim().is_empty() || episode.work_id.trim().is_empty() {
            warn!(episode_id = %episode.id, "dropping episode row without identity");
            continue;
        }
        sqlx::query(
            "INSERT INTO episode ( \
                id, work_id, translation_id, number, season, title, duration, preview_url \
            ) VALUES ( \
                $1, $2, $3, $4, $5, $6, $7, $8 \
            ) ON CONFLICT (work_id, translation_id, number) DO UPDATE SET \
                title = EXCLUDED.title, \
                season = EXCLUDED.season, \
                duration = EXCLUDED.duration, \
                preview_url = EXCLUDED.preview_url, \
                updated_at = NOW()",
        )
        .bind(&episode.id)
        .bind(&episode.work_id)
        .bind(episode.translation_id)
        .bind(episode.number)
        .bind(episode.season)
        .bind(episode.title.as_deref())
        .bind(episode.duration)
        .bind(episode.preview_url.as_deref())
        .execute(&mut *conn)
        .await?;
        written += 1;
    }
    Ok(written)
}

/// Records the published copy for an episode. At most one media row exists
/// per episode; re-publishing overwrites it.
pub async fn mark_media(conn: &mut PgConnection, media: &MediaRow) -> Result<(), StoreError> {
    if media.episode_id.trim().is_empty() || media.telegram_chat_id.trim().is_empty() {
        return Err(StoreError::InvalidInput(
            "media requires episode and chat ids".to_string(),
        ));
    }

    sqlx::query(
        "INSERT INTO episode_media ( \
            episode_id, telegram_chat_id, telegram_message_id, file_unique_id, \
            quality, source_url, checksum, size_bytes \
        ) VALUES ( \
            $1, $2, $3, $4, \
            $5, $6, $7, $8 \
        ) ON CONFLICT (episode_id) DO UPDATE SET \
            telegram_chat_id = EXCLUDED.telegram_chat_id, \
            telegram_message_id = EXCLUDED.telegram_message_id, \
            file_unique_id = EXCLUDED.file_unique_id, \
            quality = EXCLUDED.quality, \
            source_url = EXCLUDED.source_url, \
            checksum = EXCLUDED.checksum, \
            size_bytes = EXCLUDED.size_bytes",
    )
    .bind(&media.episode_id)
    .bind(&media.telegram_chat_id)
    .bind(media.telegram_message_id)
    .bind(media.file_unique_id.as_deref())
    .bind(media.quality)
    .bind(media.source_url.as_deref())
    .bind(media.checksum.as_deref())
    .bind(media.size_bytes)
    .execute(conn)
    .await?;

    Ok(())
}

/// Episodes without a published copy, in (work, translation, number) order
/// so repeated polls make deterministic progress.
pub async fn episodes_without_media(
    db: &PgPool,
    limit: i64,
) -> Result<Vec<PendingEpisode>, StoreError> {
    let rows = sqlx::query_as::<_, PendingEpisode>(
        "SELECT e.id, e.work_id, e.translation_id, e.number, e.season, \
                w.title AS work_title, w.external_ids \
         FROM episode e \
         JOIN work w ON w.id = e.work_id \
         LEFT JOIN episode_media m ON m.episode_id = e.id \
         WHERE m.episode_id IS NULL \
         ORDER BY e.work_id, e.translation_id, e.number \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(db)
    .await?;
    Ok(rows)
}

pub async fn get_work(db: &PgPool, work_id: &str) -> Result<Option<WorkRecord>, StoreError> {
    let row = sqlx::query_as::<_, WorkRecord>(
        "SELECT id, title, title_orig, alt_titles, year, poster_url, description, genres, \
                rating_shiki, rating_kinopoisk, rating_imdb, episodes_total, external_ids, \
                blocked_countries, status, created_at, updated_at \
         FROM work WHERE id = $1",
    )
    .bind(work_id)
    .fetch_optional(db)
    .await?;
    Ok(row)
}

pub async fn search_works(
    db: &PgPool,
    query: &str,
    page: i64,
    limit: i64,
) -> Result<(Vec<SearchItem>, i64), StoreError> {
    let query = query.trim();
    if query.is_empty() {
        return Ok((Vec::new(), 0));
    }
    let offset = (page.max(1) - 1) * limit;

    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM work \
         WHERE title ILIKE '%' || $1 || '%' OR title_orig ILIKE '%' || $1 || '%'",
    )
    .bind(query)
    .fetch_one(db)
    .await?;

    let items = sqlx::query_as::<_, SearchItem>(
        "SELECT id, title, year FROM work \
         WHERE title ILIKE '%' || $1 || '%' OR title_orig ILIKE '%' || $1 || '%' \
         ORDER BY COALESCE(similarity(title, $1), 0) DESC, year DESC NULLS LAST \
         LIMIT $2 OFFSET $3",
    )
    .bind(query)
    .bind(limit)
    .bind(offset)
    .fetch_all(db)
    .await?;

    Ok((items, total))
}

pub async fn touch_user(
    conn: &mut PgConnection,
    user_id: i64,
    profile: &UserProfile,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO app_user (id, username, first_name, last_name, language_code, is_premium, geo) \
        VALUES ($1, $2, $3, $4, $5, $6, $7) \
        ON CONFLICT (id) DO UPDATE SET \
            username = EXCLUDED.username, \
            first_name = EXCLUDED.first_name, \
            last_name = EXCLUDED.last_name, \
            language_code = EXCLUDED.language_code, \
            is_premium = EXCLUDED.is_premium, \
            geo = EXCLUDED.geo, \
            last_seen_at = NOW()",
    )
    .bind(user_id)
    .bind(profile.username.as_deref())
    .bind(profile.first_name.as_deref())
    .bind(profile.last_name.as_deref())
    .bind(profile.language_code.as_deref())
    .bind(profile.is_premium)
    .bind(profile.geo.as_deref())
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn favorites_for_user(
    db: &PgPool,
    user_id: i64,
) -> Result<Vec<SearchItem>, StoreError> {
    let rows = sqlx::query_as::<_, SearchItem>(
        "SELECT w.id, w.title, w.year \
         FROM favorite f \
         JOIN work w ON w.id = f.work_id \
         WHERE f.user_id = $1 \
         ORDER BY f.created_at DESC",
    )
    .bind(user_id)
    .fetch_all(db)
    .await?;
    Ok(rows)
}

pub fn episode_identity(work_id: &str, translation_id: i64, number: i32) -> String {
    format!("{}:{}:{}", work_id, translation_id, number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn episode_identity_is_composite() {
        assert_eq!(episode_identity("kodik123", 10, 2), "kodik123:10:2");
    }

    #[test]
    fn work_status_round_trips() {
        for status in [WorkStatus::Ongoing, WorkStatus::Released, WorkStatus::Announced] {
            assert_eq!(WorkStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(WorkStatus::parse("airing"), None);
    }

    #[test]
    fn store_error_display_names_the_kind() {
        let err = StoreError::Constraint("ck_episode_number_positive".to_string());
        assert!(err.to_string().contains("constraint"));
        let err = StoreError::InvalidInput("missing id".to_string());
        assert!(err.to_string().contains("invalid input"));
    }
}
