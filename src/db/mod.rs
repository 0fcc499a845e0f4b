use std::collections::HashMap;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::error::Result;

/// A file captured under archive/<job>/<number>/ at run completion.
#[derive(Debug, Clone)]
pub struct ArtifactRow {
    /// Path relative to the run's archive directory.
    pub filename: String,
    pub filesize: i64,
}

/// Gateway to the PostgreSQL store.
///
/// Every operation acquires a connection from the pool, runs parameterised
/// SQL and releases it; only run completion uses a multi-statement
/// transaction. Schema bootstrap is idempotent and runs once at startup.
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

const SCHEMA: &[&str] = &[
    r#"CREATE EXTENSION IF NOT EXISTS "uuid-ossp""#,
    r#"
    CREATE TABLE IF NOT EXISTS builds
      ( guid        UUID   DEFAULT uuid_generate_v4() PRIMARY KEY
      , number      BIGINT NOT NULL
      , queuedAt    BIGINT NOT NULL
      , startedAt   BIGINT
      , completedAt BIGINT
      , result      INT
      , outputLen   BIGINT
      , parentBuild BIGINT
      , name        TEXT   NOT NULL
      , node        TEXT
      , output      BYTEA
      , parentJob   TEXT
      , reason      TEXT
      )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS artifacts
      ( guid        UUID   DEFAULT uuid_generate_v4() PRIMARY KEY
      , number      BIGINT NOT NULL
      , filesize    BIGINT NOT NULL
      , name        TEXT   NOT NULL
      , filename    TEXT   NOT NULL
      , CONSTRAINT fk_name_number FOREIGN KEY (name, number) REFERENCES builds(name, number)
      )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_name_number ON builds (name, number DESC)",
    "CREATE INDEX IF NOT EXISTS idx_completion_time ON builds (completedAt DESC)",
    "CREATE INDEX IF NOT EXISTS idx_completed ON builds (name) WHERE result IS NOT NULL",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_name_number_filename ON artifacts (name, number, filename)",
    // result code 5 in the views below is RunState::Success
    r#"
    CREATE MATERIALIZED VIEW IF NOT EXISTS build_time_changes AS
    SELECT names.name
         , STRING_AGG(CAST(number AS TEXT), ',') AS numbers
         , STRING_AGG(CAST(diff AS TEXT), ',') AS durations
    FROM (SELECT DISTINCT name FROM builds) AS names
    JOIN LATERAL (SELECT builds.name, number, completedAt-startedAt AS diff
                  FROM builds WHERE builds.name = names.name
                  ORDER BY number DESC LIMIT 10
                 ) AS builds_last10 ON true
    GROUP BY names.name
    ORDER BY (MAX(diff)-MIN(diff))-STDDEV(diff) DESC
    LIMIT 8
    "#,
    r#"
    CREATE MATERIALIZED VIEW IF NOT EXISTS builds_per_day AS
    SELECT result
         , CAST(EXTRACT('epoch' FROM NOW()) AS BIGINT)/86400 - completedAt/86400 AS day
         , COUNT(*) AS cnt
    FROM builds
    WHERE CAST(EXTRACT('epoch' FROM NOW()) AS BIGINT)/86400 - completedAt/86400 <= 6
    GROUP BY 1, 2
    "#,
    r#"
    CREATE MATERIALIZED VIEW IF NOT EXISTS low_pass_rates AS
    SELECT name
         , CAST(COUNT(1) FILTER (WHERE result=5) AS FLOAT)/COUNT(*) AS pass_rate
    FROM builds
    GROUP BY name
    ORDER BY pass_rate ASC
    LIMIT 8
    "#,
    r#"
    CREATE MATERIALIZED VIEW IF NOT EXISTS time_per_job AS
    SELECT name
         , AVG(completedAt-startedAt) AS av
    FROM builds
    WHERE completedAt > EXTRACT('epoch' FROM NOW()) - 7 * 86400
    GROUP BY name
    ORDER BY av DESC
    LIMIT 8
    "#,
    r#"
    CREATE MATERIALIZED VIEW IF NOT EXISTS result_changed AS
    WITH stats AS (
        SELECT name
             , MAX(number) FILTER (WHERE result = 5) AS last_success
             , MAX(number) FILTER (WHERE result <> 5) AS last_failure
        FROM builds
        GROUP BY name
    )
    SELECT name, last_success, last_failure
    FROM stats
    WHERE last_success IS NOT NULL
    AND last_failure IS NOT NULL
    ORDER BY last_success - last_failure
    LIMIT 8
    "#,
    r#"
    CREATE MATERIALIZED VIEW IF NOT EXISTS builds_per_job AS
    SELECT name
         , COUNT(*) AS c
    FROM builds
    WHERE completedAt > EXTRACT('epoch' FROM NOW()) - 86400
    GROUP BY name
    ORDER BY c DESC
    LIMIT 5
    "#,
];

const VIEWS: &[&str] = &[
    "build_time_changes",
    "builds_per_day",
    "low_pass_rates",
    "time_per_job",
    "result_changed",
    "builds_per_job",
];

impl Database {
    pub async fn connect(connection_string: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(connection_string)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables, indices and materialised views. Safe to run on every
    /// startup; failure here is fatal to the daemon.
    pub async fn bootstrap(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Highest persisted build number per job, to seed the in-memory
    /// allocation table.
    pub async fn load_build_nums(&self) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query("SELECT name, MAX(number) FROM builds GROUP BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>(0), row.get::<i64, _>(1)))
            .collect())
    }

    pub async fn insert_build(
        &self,
        name: &str,
        number: i64,
        queued_at: i64,
        parent_job: Option<&str>,
        parent_build: Option<i64>,
        reason: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO builds(name,number,queuedAt,parentJob,parentBuild,reason) \
             VALUES($1,$2,$3,$4,$5,$6)",
        )
        .bind(name)
        .bind(number)
        .bind(queued_at)
        .bind(parent_job)
        .bind(parent_build)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_started(
        &self,
        name: &str,
        number: i64,
        context: &str,
        started_at: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE builds SET node = $1, startedAt = $2 WHERE name = $3 AND number = $4")
            .bind(context)
            .bind(started_at)
            .bind(name)
            .bind(number)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Most recently completed result for a job. Runs which have not started
    /// yet have completedAt NULL and sort last in a DESC ordering.
    pub async fn last_result(&self, name: &str) -> Result<Option<i32>> {
        let row =
            sqlx::query("SELECT result FROM builds WHERE name = $1 ORDER BY completedAt DESC LIMIT 1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|r| r.get::<Option<i32>, _>(0)))
    }

    /// Duration of the most recently completed run of a job, in seconds.
    pub async fn last_runtime(&self, name: &str) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT completedAt - startedAt FROM builds \
             WHERE completedAt IS NOT NULL AND name = $1 \
             ORDER BY completedAt DESC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|r| r.get::<Option<i64>, _>(0)))
    }

    /// Persist a run's outcome: the final builds row update, the streamed
    /// artifact rows and the materialised view refreshes, all in one
    /// transaction.
    pub async fn finish_build(
        &self,
        name: &str,
        number: i64,
        completed_at: i64,
        result: i32,
        output: &[u8],
        output_len: i64,
        artifacts: &[ArtifactRow],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE builds SET completedAt = $1, result = $2, output = $3, outputLen = $4 \
             WHERE name = $5 AND number = $6",
        )
        .bind(completed_at)
        .bind(result)
        .bind(output)
        .bind(output_len)
        .bind(name)
        .bind(number)
        .execute(&mut *tx)
        .await?;

        if !artifacts.is_empty() {
            let mut data = String::new();
            for artifact in artifacts {
                data.push_str(&csv_field(name));
                data.push(',');
                data.push_str(&number.to_string());
                data.push(',');
                data.push_str(&csv_field(&artifact.filename));
                data.push(',');
                data.push_str(&artifact.filesize.to_string());
                data.push('\n');
            }
            let mut copy = (&mut *tx)
                .copy_in_raw(
                    "COPY artifacts(name, number, filename, filesize) \
                     FROM STDIN WITH (FORMAT csv)",
                )
                .await?;
            copy.send(data.as_bytes()).await?;
            copy.finish().await?;
        }

        for view in VIEWS {
            sqlx::query(&format!("REFRESH MATERIALIZED VIEW {view}"))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn fetch_output(&self, name: &str, number: i64) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT output FROM builds WHERE name = $1 AND number = $2")
            .bind(name)
            .bind(number)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.get::<Option<Vec<u8>>, _>(0)))
    }

    /// Result of the newest completed build, for the badge endpoint.
    pub async fn latest_completed_result(&self, name: &str) -> Result<Option<i32>> {
        let row = sqlx::query(
            "SELECT result FROM builds WHERE name = $1 AND result IS NOT NULL \
             ORDER BY number DESC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<i32, _>(0)))
    }

    pub async fn artifacts_for(&self, name: &str, number: i64) -> Result<Vec<ArtifactRow>> {
        let rows =
            sqlx::query("SELECT filename, filesize FROM artifacts WHERE name = $1 AND number = $2")
                .bind(name)
                .bind(number)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|row| ArtifactRow {
                filename: row.get(0),
                filesize: row.get(1),
            })
            .collect())
    }
}

/// Quote a value for PostgreSQL CSV COPY input.
fn csv_field(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}
