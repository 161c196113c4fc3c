use std::{
    collections::BTreeMap,
    fs,
    path::PathBuf,
    time::SystemTime,
};

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use sqlx::Executor;

use crate::{
    capture::Site,
    conf,
    error::{Error, Result},
    types::{
        DayRecord, DaySnapshot, Exceeded, LeaderboardRow, ModelSlice,
        UserSnapshot,
    },
};

const MIGRATIONS: [&str; 1] = [include_str!("../migrations/0_data.sql")];

type Tx<'a> = sqlx::Transaction<'a, sqlx::Sqlite>;

#[derive(sqlx::FromRow)]
struct UserRow {
    username: Option<String>,
    prompt_total: u64,
    output_tokens: u64,
    co2_total: f64,
    daily_limit_prompts: u64,
    daily_limit_co2: f64,
}

#[derive(sqlx::FromRow)]
struct ModelRow {
    model: String,
    prompts: u64,
    output_tokens: u64,
    co2: f64,
}

#[derive(sqlx::FromRow)]
struct DayRow {
    prompt_count: u64,
    output_tokens: u64,
    co2_total: f64,
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    date: String,
    prompt_count: u64,
    output_tokens: u64,
    co2_total: f64,
}

#[derive(sqlx::FromRow)]
struct LeaderboardRowDb {
    uid: String,
    username: Option<String>,
    prompt_total: u64,
    co2_total: f64,
}

/// UTC calendar day at `now`, `YYYY-MM-DD`. Day attribution is the
/// server's clock at transaction time, never the client's.
#[must_use]
pub fn day_key(now: SystemTime) -> String {
    DateTime::<Utc>::from(now).format("%Y-%m-%d").to_string()
}

#[derive(Clone)]
pub struct Storage {
    pool: sqlx::Pool<sqlx::Sqlite>,
}

impl Storage {
    pub async fn connect() -> anyhow::Result<Self> {
        let file_path = PathBuf::from("data/data.db");
        if let Some(parent) = file_path.parent() {
            let ctx = format!(
                "Failed to create parent directory \
                for database file: {file_path:?}"
            );
            fs::create_dir_all(parent).context(ctx)?;
        }
        let busy_timeout = std::time::Duration::from_secs_f32(
            conf::global().sqlite_busy_timeout,
        );
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(file_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);
        let pool = sqlx::SqlitePool::connect_with(options).await?;
        let selph = Self { pool };
        selph.migrate().await?;
        Ok(selph)
    }

    /// Private per-instance database; used by tests.
    pub async fn connect_in_memory() -> anyhow::Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let selph = Self { pool };
        selph.migrate().await?;
        Ok(selph)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        for migration in MIGRATIONS {
            self.pool.execute(migration).await?;
        }
        Ok(())
    }

    /// Upsert the user record with identity-provider profile fields.
    /// Counters are untouched; this only pre-creates/refreshes the row
    /// so leaderboards have a name before the first ingested event.
    pub async fn ensure_user(
        &self,
        uid: &str,
        username: Option<&str>,
        email: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (uid, username, email)
                VALUES (?, ?, ?)
                ON CONFLICT(uid) DO UPDATE SET
                username = COALESCE(excluded.username, username),
                email = COALESCE(excluded.email, email)",
        )
        .bind(uid)
        .bind(username)
        .bind(email)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_daily_limits(
        &self,
        uid: &str,
        prompts: u64,
        co2_grams: f64,
    ) -> Result<()> {
        let prompts = to_db_count(prompts)?;
        sqlx::query(
            "INSERT INTO users (uid, daily_limit_prompts, daily_limit_co2)
                VALUES (?, ?, ?)
                ON CONFLICT(uid) DO UPDATE SET
                daily_limit_prompts = excluded.daily_limit_prompts,
                daily_limit_co2 = excluded.daily_limit_co2",
        )
        .bind(uid)
        .bind(prompts)
        .bind(co2_grams)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_prompt(
        &self,
        uid: &str,
        model: Site,
        co2_grams: f64,
    ) -> Result<(Exceeded, UserSnapshot, DaySnapshot)> {
        let now = SystemTime::now();
        self.apply(uid, model, 1, 0, co2_grams, now).await?;
        let (user, today) = self.reread(uid, now).await?;
        let exceeded = exceeded(&user, &today, true);
        Ok((exceeded, user, today))
    }

    pub async fn record_response(
        &self,
        uid: &str,
        model: Site,
        output_tokens: u64,
        co2_grams: f64,
    ) -> Result<(Exceeded, UserSnapshot, DaySnapshot)> {
        let now = SystemTime::now();
        self.apply(uid, model, 0, output_tokens, co2_grams, now)
            .await?;
        let (user, today) = self.reread(uid, now).await?;
        let exceeded = exceeded(&user, &today, false);
        Ok((exceeded, user, today))
    }

    pub async fn get_stats(
        &self,
        uid: &str,
    ) -> Result<(UserSnapshot, DaySnapshot, Exceeded)> {
        let now = SystemTime::now();
        let (user, today) = self.reread(uid, now).await?;
        let exceeded = exceeded(&user, &today, true);
        Ok((user, today, exceeded))
    }

    pub async fn leaderboard(
        &self,
        limit: u32,
    ) -> Result<Vec<LeaderboardRow>> {
        let rows: Vec<LeaderboardRowDb> = sqlx::query_as(
            "SELECT uid, username, prompt_total, co2_total FROM users
                ORDER BY prompt_total DESC
                LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| LeaderboardRow {
                uid: row.uid,
                username: row.username,
                prompt_total: row.prompt_total,
                co2_total: row.co2_total,
            })
            .collect())
    }

    /// Daily records for the trailing year, ascending by date. Feeds the
    /// dashboard heatmap and weekly chart.
    pub async fn history_year(&self, uid: &str) -> Result<Vec<DayRecord>> {
        let cutoff = DateTime::<Utc>::from(SystemTime::now()) - Duration::days(365);
        let cutoff = cutoff.format("%Y-%m-%d").to_string();
        let rows: Vec<HistoryRow> = sqlx::query_as(
            "SELECT date, prompt_count, output_tokens, co2_total
                FROM history
                WHERE uid = ? AND date >= ?
                ORDER BY date",
        )
        .bind(uid)
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| DayRecord {
                date: row.date,
                prompt_count: row.prompt_count,
                output_tokens: row.output_tokens,
                co2_total: row.co2_total,
            })
            .collect())
    }

    /// One ingestion increment, applied in a single transaction.
    ///
    /// Two-phase by construction: all reads happen before all writes,
    /// and counters only ever move via in-database increments, never via
    /// read-modify-write of fetched values. Concurrent transactions for
    /// the same (user, day) may interleave freely; the increments
    /// commute.
    async fn apply(
        &self,
        uid: &str,
        model: Site,
        prompts: u64,
        output_tokens: u64,
        co2_grams: f64,
        now: SystemTime,
    ) -> Result<()> {
        let date = day_key(now);
        let prompts = to_db_count(prompts)?;
        let output_tokens = to_db_count(output_tokens)?;
        let mut tx: Tx<'_> = self.pool.begin().await?;

        // Read phase.
        let known: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM users WHERE uid = ?")
                .bind(uid)
                .fetch_optional(&mut *tx)
                .await?;

        // Write phase.
        if known.is_none() {
            sqlx::query("INSERT OR IGNORE INTO users (uid) VALUES (?)")
                .bind(uid)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "UPDATE users SET
                prompt_total = prompt_total + ?,
                output_tokens = output_tokens + ?,
                co2_total = co2_total + ?
                WHERE uid = ?",
        )
        .bind(prompts)
        .bind(output_tokens)
        .bind(co2_grams)
        .bind(uid)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO model_totals (uid, model, prompts, output_tokens, co2)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(uid, model) DO UPDATE SET
                prompts = prompts + excluded.prompts,
                output_tokens = output_tokens + excluded.output_tokens,
                co2 = co2 + excluded.co2",
        )
        .bind(uid)
        .bind(model.as_str())
        .bind(prompts)
        .bind(output_tokens)
        .bind(co2_grams)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO history (uid, date, prompt_count, output_tokens, co2_total)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(uid, date) DO UPDATE SET
                prompt_count = prompt_count + excluded.prompt_count,
                output_tokens = output_tokens + excluded.output_tokens,
                co2_total = co2_total + excluded.co2_total",
        )
        .bind(uid)
        .bind(&date)
        .bind(prompts)
        .bind(output_tokens)
        .bind(co2_grams)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO history_models (uid, date, model, prompts, output_tokens, co2)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(uid, date, model) DO UPDATE SET
                prompts = prompts + excluded.prompts,
                output_tokens = output_tokens + excluded.output_tokens,
                co2 = co2 + excluded.co2",
        )
        .bind(uid)
        .bind(&date)
        .bind(model.as_str())
        .bind(prompts)
        .bind(output_tokens)
        .bind(co2_grams)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Post-commit snapshot read. An unknown user reads as zero-valued
    /// defaults rather than an error.
    async fn reread(
        &self,
        uid: &str,
        now: SystemTime,
    ) -> Result<(UserSnapshot, DaySnapshot)> {
        let user = self.user_snapshot(uid).await?;
        let today = self.day_snapshot(uid, &day_key(now)).await?;
        Ok((user, today))
    }

    async fn user_snapshot(&self, uid: &str) -> Result<UserSnapshot> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT username, prompt_total, output_tokens, co2_total,
                daily_limit_prompts, daily_limit_co2
                FROM users WHERE uid = ?",
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(UserSnapshot::default());
        };
        let models: Vec<ModelRow> = sqlx::query_as(
            "SELECT model, prompts, output_tokens, co2
                FROM model_totals WHERE uid = ?",
        )
        .bind(uid)
        .fetch_all(&self.pool)
        .await?;
        Ok(UserSnapshot {
            username: row.username,
            prompt_total: row.prompt_total,
            output_tokens: row.output_tokens,
            co2_total: row.co2_total,
            daily_limit_prompts: row.daily_limit_prompts,
            daily_limit_co2: row.daily_limit_co2,
            model_totals: model_map(models),
        })
    }

    async fn day_snapshot(
        &self,
        uid: &str,
        date: &str,
    ) -> Result<DaySnapshot> {
        let row: Option<DayRow> = sqlx::query_as(
            "SELECT prompt_count, output_tokens, co2_total
                FROM history WHERE uid = ? AND date = ?",
        )
        .bind(uid)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(DaySnapshot::default());
        };
        let models: Vec<ModelRow> = sqlx::query_as(
            "SELECT model, prompts, output_tokens, co2
                FROM history_models WHERE uid = ? AND date = ?",
        )
        .bind(uid)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        Ok(DaySnapshot {
            prompt_count: row.prompt_count,
            output_tokens: row.output_tokens,
            co2_total: row.co2_total,
            model_breakdown: model_map(models),
        })
    }
}

fn model_map(rows: Vec<ModelRow>) -> BTreeMap<String, ModelSlice> {
    rows.into_iter()
        .map(|row| {
            (
                row.model,
                ModelSlice {
                    prompts: row.prompts,
                    output_tokens: row.output_tokens,
                    co2: row.co2,
                },
            )
        })
        .collect()
}

/// 0-or-absent limits mean "no limit, never exceeded".
fn exceeded(
    user: &UserSnapshot,
    today: &DaySnapshot,
    with_prompts: bool,
) -> Exceeded {
    let prompts = user.daily_limit_prompts > 0
        && today.prompt_count >= user.daily_limit_prompts;
    let co2 = user.daily_limit_co2 > 0.0
        && today.co2_total >= user.daily_limit_co2;
    Exceeded {
        prompts: with_prompts.then_some(prompts),
        co2,
    }
}

fn to_db_count(n: u64) -> Result<i64> {
    i64::try_from(n)
        .map_err(|_| Error::InvalidInput(format!("count out of range: {n}")))
}
