use chrono::Utc;
use serde_json::{json, Map, Value};
use sqlx::Row;

use crate::engine::{collect_artifacts, Engine};
use crate::error::Result;
use crate::scheduler::RunState;

const RUNS_PER_PAGE: i64 = 20;

/// What a status document describes: a single run, one job's history, every
/// job, or the home dashboard.
#[derive(Debug, Clone)]
pub enum StatusScope {
    Run {
        job: String,
        number: i64,
    },
    Job {
        job: String,
        page: i64,
        field: String,
        order_desc: bool,
    },
    All,
    Home,
}

fn title() -> String {
    std::env::var("LAMINAR_TITLE").unwrap_or_else(|_| "Laminar".to_string())
}

fn artifact_json(archive_url: &str, job: &str, number: i64, filename: &str, size: i64) -> Value {
    json!({
        "url": format!("{archive_url}{job}/{number}/{filename}"),
        "filename": filename,
        "size": size,
    })
}

/// A comma-separated list of integers as a JSON array. NULL or empty input
/// yields an empty array.
fn csv_numbers(csv: &str) -> Value {
    Value::Array(
        csv.split(',')
            .filter_map(|part| part.trim().parse::<i64>().ok())
            .map(Value::from)
            .collect(),
    )
}

impl Engine {
    /// Produce the JSON snapshot for one monitoring scope, wrapped in the
    /// common `{type, title, version, time, data}` envelope.
    pub async fn get_status(&self, scope: StatusScope) -> Result<Value> {
        let data = match scope {
            StatusScope::Run { job, number } => self.run_status(&job, number).await?,
            StatusScope::Job {
                job,
                page,
                field,
                order_desc,
            } => self.job_status(&job, page, &field, order_desc).await?,
            StatusScope::All => self.all_status().await?,
            StatusScope::Home => self.home_status().await?,
        };
        Ok(json!({
            "type": "status",
            "title": title(),
            "version": env!("CARGO_PKG_VERSION"),
            "time": Utc::now().timestamp(),
            "data": data,
        }))
    }

    async fn run_status(&self, job: &str, number: i64) -> Result<Value> {
        let mut data = json!({});
        let mut is_completed = false;

        let row = sqlx::query(
            "SELECT queuedAt,startedAt,completedAt,result,reason,parentJob,parentBuild,q.lr \
             FROM builds \
             LEFT JOIN (SELECT DISTINCT ON (name) name n, completedAt-startedAt lr FROM builds \
                        WHERE result IS NOT NULL ORDER BY name, number DESC) q ON q.n = name \
             WHERE name = $1 AND number = $2",
        )
        .bind(job)
        .bind(number)
        .fetch_optional(self.db.pool())
        .await?;

        if let Some(row) = row {
            let queued: i64 = row.get(0);
            let started: Option<i64> = row.get(1);
            let completed: Option<i64> = row.get(2);
            let result: Option<i32> = row.get(3);
            let reason: Option<String> = row.get(4);
            let parent_job: Option<String> = row.get(5);
            let parent_build: Option<i64> = row.get(6);
            let last_runtime: Option<i64> = row.get(7);

            data["queued"] = json!(queued);
            data["started"] = json!(started.unwrap_or(0));
            if let Some(completed) = completed {
                data["completed"] = json!(completed);
                is_completed = true;
            }
            let state = if is_completed {
                RunState::from_code(result.unwrap_or(0))
            } else if started.is_some() {
                RunState::Running
            } else {
                RunState::Queued
            };
            data["result"] = json!(state.to_string());
            data["reason"] = json!(reason.unwrap_or_default());
            data["upstream"] = json!({
                "name": parent_job.unwrap_or_default(),
                "num": parent_build.unwrap_or(0),
            });
            if let Some(last_runtime) = last_runtime {
                data["etc"] = json!(started.unwrap_or(0) + last_runtime);
            }
        }

        {
            let state = self.state.read().await;
            let latest = state.latest_build_num(job);
            if latest > 0 {
                data["latestNum"] = json!(latest);
            }
        }

        let archive_url = &self.settings.archive_url;
        data["artifacts"] = if is_completed {
            Value::Array(
                self.db
                    .artifacts_for(job, number)
                    .await?
                    .iter()
                    .map(|a| artifact_json(archive_url, job, number, &a.filename, a.filesize))
                    .collect(),
            )
        } else {
            Value::Array(
                collect_artifacts(&self.settings.archive_dir(job, number))
                    .await
                    .iter()
                    .map(|a| artifact_json(archive_url, job, number, &a.filename, a.filesize))
                    .collect(),
            )
        };
        Ok(data)
    }

    async fn job_status(&self, job: &str, page: i64, field: &str, order_desc: bool) -> Result<Value> {
        let pool = self.db.pool();
        let mut data = json!({});

        // ORDER BY cannot be bound as a parameter; whitelist the sort field
        // and fall back to number DESC for anything unrecognised.
        let direction = if order_desc { "DESC" } else { "ASC" };
        let order_by = match field {
            "number" => format!("number {direction}"),
            "result" => format!("result {direction}, number DESC"),
            "started" => format!("startedAt {direction}, number DESC"),
            "duration" => format!("(completedAt-startedAt) {direction}, number DESC"),
            _ => "number DESC".to_string(),
        };
        let stmt = format!(
            "SELECT number,startedAt,completedAt,result,reason FROM builds \
             WHERE name = $1 AND result IS NOT NULL ORDER BY {order_by} LIMIT $2 OFFSET $3"
        );
        let recent: Vec<Value> = sqlx::query(&stmt)
            .bind(job)
            .bind(RUNS_PER_PAGE)
            .bind(page * RUNS_PER_PAGE)
            .fetch_all(pool)
            .await?
            .iter()
            .map(|row| {
                json!({
                    "number": row.get::<i64, _>(0),
                    "started": row.get::<Option<i64>, _>(1).unwrap_or(0),
                    "completed": row.get::<Option<i64>, _>(2).unwrap_or(0),
                    "result": RunState::from_code(row.get::<Option<i32>, _>(3).unwrap_or(0)).to_string(),
                    "reason": row.get::<Option<String>, _>(4).unwrap_or_default(),
                })
            })
            .collect();
        data["recent"] = Value::Array(recent);

        let counts = sqlx::query(
            "SELECT COUNT(*),CAST(AVG(completedAt-startedAt) AS INT) FROM builds \
             WHERE name = $1 AND result IS NOT NULL",
        )
        .bind(job)
        .fetch_one(pool)
        .await?;
        let n_runs: i64 = counts.get(0);
        let average_runtime: Option<i32> = counts.get(1);
        data["averageRuntime"] = json!(average_runtime.unwrap_or(0));
        data["pages"] = json!((n_runs - 1) / RUNS_PER_PAGE + 1);
        data["sort"] = json!({
            "page": page,
            "field": field,
            "order": if order_desc { "dsc" } else { "asc" },
        });

        {
            let state = self.state.read().await;
            data["running"] = Value::Array(
                state
                    .active
                    .iter()
                    .filter(|r| r.name == job)
                    .map(|r| {
                        json!({
                            "number": r.number,
                            "context": r.context,
                            "started": r.started_at,
                            "result": RunState::Running.to_string(),
                            "reason": r.reason,
                        })
                    })
                    .collect(),
            );
            data["queued"] = Value::Array(
                state
                    .queued
                    .iter()
                    .filter(|r| r.name == job)
                    .map(|r| {
                        json!({
                            "number": r.number,
                            "result": RunState::Queued.to_string(),
                            "reason": r.reason,
                        })
                    })
                    .collect(),
            );
            if let Some(desc) = state.job_descriptions.get(job) {
                data["description"] = json!(desc);
            } else {
                data["description"] = json!("");
            }
        }

        let last_success = sqlx::query(
            "SELECT number,startedAt FROM builds WHERE name = $1 AND result = $2 \
             ORDER BY completedAt DESC LIMIT 1",
        )
        .bind(job)
        .bind(RunState::Success.code())
        .fetch_optional(pool)
        .await?;
        if let Some(row) = last_success {
            data["lastSuccess"] = json!({
                "number": row.get::<i64, _>(0),
                "started": row.get::<Option<i64>, _>(1).unwrap_or(0),
            });
        }
        let last_failed = sqlx::query(
            "SELECT number,startedAt FROM builds WHERE name = $1 AND result <> $2 \
             ORDER BY completedAt DESC LIMIT 1",
        )
        .bind(job)
        .bind(RunState::Success.code())
        .fetch_optional(pool)
        .await?;
        if let Some(row) = last_failed {
            data["lastFailed"] = json!({
                "number": row.get::<i64, _>(0),
                "started": row.get::<Option<i64>, _>(1).unwrap_or(0),
            });
        }

        Ok(data)
    }

    async fn all_status(&self) -> Result<Value> {
        let mut data = json!({});

        let jobs: Vec<Value> = sqlx::query(
            "SELECT DISTINCT ON (name) name, number, startedAt, completedAt, result, reason \
             FROM builds ORDER BY name, number DESC",
        )
        .fetch_all(self.db.pool())
        .await?
        .iter()
        .map(|row| {
            json!({
                "name": row.get::<String, _>(0),
                "number": row.get::<i64, _>(1),
                "result": RunState::from_code(row.get::<Option<i32>, _>(4).unwrap_or(0)).to_string(),
                "started": row.get::<Option<i64>, _>(2).unwrap_or(0),
                "completed": row.get::<Option<i64>, _>(3).unwrap_or(0),
                "reason": row.get::<Option<String>, _>(5).unwrap_or_default(),
            })
        })
        .collect();
        data["jobs"] = Value::Array(jobs);

        let state = self.state.read().await;
        data["running"] = Value::Array(
            state
                .active
                .iter()
                .map(|r| {
                    json!({
                        "name": r.name,
                        "number": r.number,
                        "context": r.context,
                        "started": r.started_at,
                    })
                })
                .collect(),
        );
        data["groups"] = Value::Object(
            state
                .job_groups
                .iter()
                .map(|(label, regex)| (label.clone(), Value::from(regex.clone())))
                .collect(),
        );
        Ok(data)
    }

    async fn home_status(&self) -> Result<Value> {
        let pool = self.db.pool();
        let mut data = json!({});

        let recent: Vec<Value> = sqlx::query(
            "SELECT name,number,node,queuedAt,startedAt,completedAt,result,reason FROM builds \
             WHERE completedAt IS NOT NULL ORDER BY completedAt DESC LIMIT 20",
        )
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| {
            json!({
                "name": row.get::<String, _>(0),
                "number": row.get::<i64, _>(1),
                "context": row.get::<Option<String>, _>(2).unwrap_or_default(),
                "queued": row.get::<i64, _>(3),
                "started": row.get::<Option<i64>, _>(4).unwrap_or(0),
                "completed": row.get::<Option<i64>, _>(5).unwrap_or(0),
                "result": RunState::from_code(row.get::<Option<i32>, _>(6).unwrap_or(0)).to_string(),
                "reason": row.get::<Option<String>, _>(7).unwrap_or_default(),
            })
        })
        .collect();
        data["recent"] = Value::Array(recent);

        {
            let state = self.state.read().await;

            let mut running = Vec::new();
            for r in &state.active {
                let mut entry = json!({
                    "name": r.name,
                    "number": r.number,
                    "context": r.context,
                    "started": r.started_at,
                });
                if let Ok(Some(last_runtime)) = self.db.last_runtime(&r.name).await {
                    entry["etc"] = json!(r.started_at + last_runtime);
                }
                running.push(entry);
            }
            data["running"] = Value::Array(running);

            data["queued"] = Value::Array(
                state
                    .queued
                    .iter()
                    .map(|r| {
                        json!({
                            "name": r.name,
                            "number": r.number,
                            "result": RunState::Queued.to_string(),
                        })
                    })
                    .collect(),
            );

            let (total, busy) = state.executor_totals();
            data["executorsTotal"] = json!(total);
            data["executorsBusy"] = json!(busy);
        }

        let mut builds_per_day = Vec::with_capacity(7);
        for day in (0..=6).rev() {
            let mut bucket = Map::new();
            for row in sqlx::query("SELECT result, cnt FROM builds_per_day WHERE day = $1")
                .bind(day as i64)
                .fetch_all(pool)
                .await?
            {
                let result: Option<i32> = row.get(0);
                let count: i64 = row.get(1);
                bucket.insert(
                    RunState::from_code(result.unwrap_or(0)).to_string(),
                    Value::from(count),
                );
            }
            builds_per_day.push(Value::Object(bucket));
        }
        data["buildsPerDay"] = Value::Array(builds_per_day);

        let mut builds_per_job = Map::new();
        for row in sqlx::query("SELECT name, c FROM builds_per_job")
            .fetch_all(pool)
            .await?
        {
            builds_per_job.insert(row.get::<String, _>(0), Value::from(row.get::<i64, _>(1)));
        }
        data["buildsPerJob"] = Value::Object(builds_per_job);

        let mut time_per_job = Map::new();
        for row in sqlx::query("SELECT name, CAST(av AS FLOAT8) FROM time_per_job")
            .fetch_all(pool)
            .await?
        {
            time_per_job.insert(
                row.get::<String, _>(0),
                Value::from(row.get::<Option<f64>, _>(1).unwrap_or(0.0)),
            );
        }
        data["timePerJob"] = Value::Object(time_per_job);

        data["resultChanged"] = Value::Array(
            sqlx::query("SELECT name, last_success, last_failure FROM result_changed")
                .fetch_all(pool)
                .await?
                .iter()
                .map(|row| {
                    json!({
                        "name": row.get::<String, _>(0),
                        "lastSuccess": row.get::<i64, _>(1),
                        "lastFailure": row.get::<i64, _>(2),
                    })
                })
                .collect(),
        );

        data["lowPassRates"] = Value::Array(
            sqlx::query("SELECT name, pass_rate FROM low_pass_rates")
                .fetch_all(pool)
                .await?
                .iter()
                .map(|row| {
                    json!({
                        "name": row.get::<String, _>(0),
                        "passRate": row.get::<Option<f64>, _>(1).unwrap_or(0.0),
                    })
                })
                .collect(),
        );

        data["buildTimeChanges"] = Value::Array(
            sqlx::query("SELECT name, numbers, durations FROM build_time_changes")
                .fetch_all(pool)
                .await?
                .iter()
                .map(|row| {
                    json!({
                        "name": row.get::<String, _>(0),
                        "numbers": csv_numbers(&row.get::<Option<String>, _>(1).unwrap_or_default()),
                        "durations": csv_numbers(&row.get::<Option<String>, _>(2).unwrap_or_default()),
                    })
                })
                .collect(),
        );

        let mut completed_counts = Map::new();
        for row in sqlx::query("SELECT name, COUNT(*) FROM builds WHERE result IS NOT NULL GROUP BY name")
            .fetch_all(pool)
            .await?
        {
            completed_counts.insert(row.get::<String, _>(0), Value::from(row.get::<i64, _>(1)));
        }
        data["completedCounts"] = Value::Object(completed_counts);

        Ok(data)
    }
}
