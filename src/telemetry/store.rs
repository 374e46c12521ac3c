//! 指纹样本存储和异步服务
//!
//! samples 是只追加的事实表;model_stats / session_stats 两张聚合表
//! 在每次落库时从 samples 整体重算并 upsert,因此聚合永远可以由
//! 事实表重放得出,不存在累加漂移。

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::mpsc;

use super::model::Sample;
use super::types::{
    BackendShare, ModelStatsRow, OverviewStats, SampleListResponse, SampleQuery, SessionStatsRow,
};

/// 底层 SQLite 存储(同步)
struct SampleStore {
    conn: std::sync::Mutex<Connection>,
}

impl SampleStore {
    fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                session_id TEXT NOT NULL DEFAULT '',
                model_requested TEXT NOT NULL DEFAULT 'unknown',
                model_response TEXT NOT NULL DEFAULT '',
                model_match INTEGER NOT NULL DEFAULT 1,
                model_ui_selected TEXT NOT NULL DEFAULT '',
                ui_api_mismatch INTEGER NOT NULL DEFAULT 0,
                is_subagent INTEGER NOT NULL DEFAULT 0,
                subagent_type TEXT,
                thinking_enabled INTEGER NOT NULL DEFAULT 0,
                thinking_budget_requested INTEGER NOT NULL DEFAULT 0,
                thinking_budget_tier TEXT NOT NULL DEFAULT 'none',
                thinking_chunk_count INTEGER NOT NULL DEFAULT 0,
                thinking_tokens_used INTEGER NOT NULL DEFAULT 0,
                thinking_utilization REAL NOT NULL DEFAULT 0,
                thinking_duration_ms REAL NOT NULL DEFAULT 0,
                thinking_itt_mean_ms REAL NOT NULL DEFAULT 0,
                thinking_itt_std_ms REAL NOT NULL DEFAULT 0,
                text_chunk_count INTEGER NOT NULL DEFAULT 0,
                text_duration_ms REAL NOT NULL DEFAULT 0,
                text_itt_mean_ms REAL NOT NULL DEFAULT 0,
                text_itt_std_ms REAL NOT NULL DEFAULT 0,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
                cache_read_tokens INTEGER NOT NULL DEFAULT 0,
                cache_efficiency REAL NOT NULL DEFAULT 0,
                ttft_ms REAL NOT NULL DEFAULT 0,
                total_time_ms REAL NOT NULL DEFAULT 0,
                itt_mean_ms REAL NOT NULL DEFAULT 0,
                itt_std_ms REAL NOT NULL DEFAULT 0,
                itt_min_ms REAL NOT NULL DEFAULT 0,
                itt_max_ms REAL NOT NULL DEFAULT 0,
                itt_p50_ms REAL NOT NULL DEFAULT 0,
                itt_p90_ms REAL NOT NULL DEFAULT 0,
                itt_p99_ms REAL NOT NULL DEFAULT 0,
                variance_coef REAL NOT NULL DEFAULT 0,
                tokens_per_sec REAL NOT NULL DEFAULT 0,
                num_chunks INTEGER NOT NULL DEFAULT 0,
                classified_backend TEXT NOT NULL DEFAULT 'unknown',
                confidence REAL NOT NULL DEFAULT 0,
                location TEXT NOT NULL DEFAULT 'unknown',
                backend_evidence TEXT NOT NULL DEFAULT '[]',
                speculative_decoding INTEGER NOT NULL DEFAULT 0,
                speculative_type TEXT,
                request_id TEXT NOT NULL DEFAULT '',
                stop_reason TEXT NOT NULL DEFAULT '',
                envoy_time_ms REAL NOT NULL DEFAULT 0,
                cf_ray TEXT NOT NULL DEFAULT '',
                cf_edge_location TEXT NOT NULL DEFAULT '',
                rl_5h_utilization REAL NOT NULL DEFAULT 0,
                rl_5h_reset INTEGER NOT NULL DEFAULT 0,
                rl_5h_status TEXT NOT NULL DEFAULT '',
                rl_7d_utilization REAL NOT NULL DEFAULT 0,
                rl_7d_reset INTEGER NOT NULL DEFAULT 0,
                rl_7d_status TEXT NOT NULL DEFAULT '',
                rl_overall_status TEXT NOT NULL DEFAULT '',
                rl_binding_window TEXT NOT NULL DEFAULT '',
                rl_fallback_pct REAL NOT NULL DEFAULT 0,
                rl_overage_status TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_samples_timestamp ON samples(timestamp);
            CREATE INDEX IF NOT EXISTS idx_samples_session ON samples(session_id);
            CREATE INDEX IF NOT EXISTS idx_samples_model_requested ON samples(model_requested);
            CREATE INDEX IF NOT EXISTS idx_samples_model_response ON samples(model_response);
            CREATE INDEX IF NOT EXISTS idx_samples_backend ON samples(classified_backend);
            CREATE TABLE IF NOT EXISTS model_stats (
                model TEXT PRIMARY KEY,
                samples_count INTEGER NOT NULL DEFAULT 0,
                itt_mean_baseline REAL NOT NULL DEFAULT 0,
                itt_std_baseline REAL NOT NULL DEFAULT 0,
                tps_baseline REAL NOT NULL DEFAULT 0,
                ttft_baseline REAL NOT NULL DEFAULT 0,
                trainium_count INTEGER NOT NULL DEFAULT 0,
                tpu_count INTEGER NOT NULL DEFAULT 0,
                gpu_count INTEGER NOT NULL DEFAULT 0,
                trainium_pct REAL NOT NULL DEFAULT 0,
                tpu_pct REAL NOT NULL DEFAULT 0,
                gpu_pct REAL NOT NULL DEFAULT 0,
                cache_efficiency_avg REAL NOT NULL DEFAULT 0,
                cache_efficiency_min REAL NOT NULL DEFAULT 0,
                cache_efficiency_max REAL NOT NULL DEFAULT 0,
                thinking_utilization_avg REAL NOT NULL DEFAULT 0,
                last_updated TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS session_stats (
                session_id TEXT PRIMARY KEY,
                start_time TEXT NOT NULL DEFAULT '',
                end_time TEXT NOT NULL DEFAULT '',
                sample_count INTEGER NOT NULL DEFAULT 0,
                picker_model TEXT NOT NULL DEFAULT '',
                direct_count INTEGER NOT NULL DEFAULT 0,
                subagent_count INTEGER NOT NULL DEFAULT 0,
                haiku_count INTEGER NOT NULL DEFAULT 0,
                sonnet_count INTEGER NOT NULL DEFAULT 0,
                itt_mean_start REAL NOT NULL DEFAULT 0,
                itt_mean_end REAL NOT NULL DEFAULT 0,
                itt_trend_pct REAL NOT NULL DEFAULT 0,
                itt_trend_direction TEXT NOT NULL DEFAULT 'stable',
                trainium_count INTEGER NOT NULL DEFAULT 0,
                gpu_count INTEGER NOT NULL DEFAULT 0,
                tpu_count INTEGER NOT NULL DEFAULT 0,
                backend_switches INTEGER NOT NULL DEFAULT 0,
                cache_efficiency_avg REAL NOT NULL DEFAULT 0,
                last_updated TEXT NOT NULL DEFAULT ''
            );",
        )?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    /// 插入样本并重算两张聚合表,整体在一个事务里
    fn add_sample(&self, sample: &Sample) -> Result<(String, f64)> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        insert_sample(&tx, sample)?;

        let model = if sample.model_response.is_empty() {
            &sample.model_requested
        } else {
            &sample.model_response
        };
        update_model_stats(&tx, model)?;
        if !sample.session_id.is_empty() {
            update_session_stats(&tx, &sample.session_id)?;
        }
        tx.commit()?;
        Ok((sample.classified_backend.clone(), sample.confidence))
    }

    fn query(&self, filter: &SampleQuery) -> Result<SampleListResponse> {
        let conn = self.conn.lock().unwrap();
        let page = filter.page.unwrap_or(1).max(1);
        let page_size = filter.page_size.unwrap_or(50).clamp(1, 200);
        let offset = (page - 1) * page_size;

        let mut where_clauses = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref model) = filter.model {
            where_clauses.push(format!(
                "(model_response = ?{n} OR model_requested = ?{n})",
                n = params.len() + 1
            ));
            params.push(Box::new(model.clone()));
        }
        if let Some(ref session_id) = filter.session_id {
            where_clauses.push(format!("session_id = ?{}", params.len() + 1));
            params.push(Box::new(session_id.clone()));
        }
        if let Some(ref backend) = filter.backend {
            where_clauses.push(format!("classified_backend = ?{}", params.len() + 1));
            params.push(Box::new(backend.clone()));
        }
        if let Some(ref start_time) = filter.start_time {
            let normalized = chrono::DateTime::parse_from_rfc3339(start_time)
                .map(|dt| dt.with_timezone(&Utc).to_rfc3339())
                .unwrap_or_else(|_| start_time.clone());
            where_clauses.push(format!("timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(normalized));
        }
        if let Some(ref end_time) = filter.end_time {
            let normalized = chrono::DateTime::parse_from_rfc3339(end_time)
                .map(|dt| dt.with_timezone(&Utc).to_rfc3339())
                .unwrap_or_else(|_| end_time.clone());
            where_clauses.push(format!("timestamp <= ?{}", params.len() + 1));
            params.push(Box::new(normalized));
        }

        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM samples {}", where_sql);
        let total: u64 = conn.query_row(
            &count_sql,
            rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            |row| row.get(0),
        )?;

        let query_sql = format!(
            "SELECT {} FROM samples {} ORDER BY id DESC LIMIT ?{} OFFSET ?{}",
            SAMPLE_COLUMNS,
            where_sql,
            params.len() + 1,
            params.len() + 2
        );
        params.push(Box::new(page_size as i64));
        params.push(Box::new(offset as i64));

        let mut stmt = conn.prepare(&query_sql)?;
        let samples = stmt
            .query_map(
                rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                row_to_sample,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(SampleListResponse {
            total,
            page,
            page_size,
            samples,
        })
    }

    fn latest(&self) -> Result<Option<Sample>> {
        let conn = self.conn.lock().unwrap();
        let sample = conn
            .query_row(
                &format!(
                    "SELECT {} FROM samples ORDER BY id DESC LIMIT 1",
                    SAMPLE_COLUMNS
                ),
                [],
                row_to_sample,
            )
            .optional()?;
        Ok(sample)
    }

    fn get_stats(&self) -> Result<OverviewStats> {
        let conn = self.conn.lock().unwrap();

        let (
            total_samples,
            session_count,
            mismatch_count,
            subagent_count,
            speculative_count,
            avg_itt,
            avg_tps,
        ): (u64, u64, u64, u64, u64, f64, f64) = conn.query_row(
            "SELECT COUNT(*),
                    COUNT(DISTINCT session_id),
                    COUNT(CASE WHEN ui_api_mismatch != 0 THEN 1 END),
                    COUNT(CASE WHEN is_subagent != 0 THEN 1 END),
                    COUNT(CASE WHEN speculative_decoding != 0 THEN 1 END),
                    COALESCE(AVG(CASE WHEN itt_mean_ms > 0 THEN itt_mean_ms END), 0),
                    COALESCE(AVG(CASE WHEN tokens_per_sec > 0 THEN tokens_per_sec END), 0)
             FROM samples",
            [],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            },
        )?;

        let mut stmt = conn.prepare(
            "SELECT classified_backend, COUNT(*) FROM samples GROUP BY classified_backend ORDER BY COUNT(*) DESC",
        )?;
        let backends = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(backend, count)| BackendShare {
                backend,
                count,
                pct: if total_samples > 0 {
                    count as f64 / total_samples as f64 * 100.0
                } else {
                    0.0
                },
            })
            .collect();

        Ok(OverviewStats {
            total_samples,
            session_count,
            mismatch_count,
            subagent_count,
            speculative_count,
            avg_itt_mean_ms: avg_itt,
            avg_tokens_per_sec: avg_tps,
            backends,
        })
    }

    fn model_stats(&self) -> Result<Vec<ModelStatsRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT model, samples_count, itt_mean_baseline, itt_std_baseline, tps_baseline, ttft_baseline,
                    trainium_count, tpu_count, gpu_count, trainium_pct, tpu_pct, gpu_pct,
                    cache_efficiency_avg, cache_efficiency_min, cache_efficiency_max,
                    thinking_utilization_avg, last_updated
             FROM model_stats ORDER BY samples_count DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ModelStatsRow {
                    model: row.get(0)?,
                    samples_count: row.get(1)?,
                    itt_mean_baseline: row.get(2)?,
                    itt_std_baseline: row.get(3)?,
                    tps_baseline: row.get(4)?,
                    ttft_baseline: row.get(5)?,
                    trainium_count: row.get(6)?,
                    tpu_count: row.get(7)?,
                    gpu_count: row.get(8)?,
                    trainium_pct: row.get(9)?,
                    tpu_pct: row.get(10)?,
                    gpu_pct: row.get(11)?,
                    cache_efficiency_avg: row.get(12)?,
                    cache_efficiency_min: row.get(13)?,
                    cache_efficiency_max: row.get(14)?,
                    thinking_utilization_avg: row.get(15)?,
                    last_updated: row.get(16)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn session_stats(&self) -> Result<Vec<SessionStatsRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_id, start_time, end_time, sample_count, picker_model,
                    direct_count, subagent_count, haiku_count, sonnet_count,
                    itt_mean_start, itt_mean_end, itt_trend_pct, itt_trend_direction,
                    trainium_count, gpu_count, tpu_count, backend_switches,
                    cache_efficiency_avg, last_updated
             FROM session_stats ORDER BY start_time DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SessionStatsRow {
                    session_id: row.get(0)?,
                    start_time: row.get(1)?,
                    end_time: row.get(2)?,
                    sample_count: row.get(3)?,
                    picker_model: row.get(4)?,
                    direct_count: row.get(5)?,
                    subagent_count: row.get(6)?,
                    haiku_count: row.get(7)?,
                    sonnet_count: row.get(8)?,
                    itt_mean_start: row.get(9)?,
                    itt_mean_end: row.get(10)?,
                    itt_trend_pct: row.get(11)?,
                    itt_trend_direction: row.get(12)?,
                    trainium_count: row.get(13)?,
                    gpu_count: row.get(14)?,
                    tpu_count: row.get(15)?,
                    backend_switches: row.get(16)?,
                    cache_efficiency_avg: row.get(17)?,
                    last_updated: row.get(18)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// 清空事实表与两张聚合表,返回删掉的样本数
    fn clear(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let count = tx.execute("DELETE FROM samples", [])?;
        tx.execute("DELETE FROM model_stats", [])?;
        tx.execute("DELETE FROM session_stats", [])?;
        tx.commit()?;
        Ok(count as u64)
    }
}

const SAMPLE_COLUMNS: &str = "id, timestamp, session_id, model_requested, model_response, model_match, \
     model_ui_selected, ui_api_mismatch, is_subagent, subagent_type, \
     thinking_enabled, thinking_budget_requested, thinking_budget_tier, thinking_chunk_count, \
     thinking_tokens_used, thinking_utilization, thinking_duration_ms, thinking_itt_mean_ms, thinking_itt_std_ms, \
     text_chunk_count, text_duration_ms, text_itt_mean_ms, text_itt_std_ms, \
     input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens, cache_efficiency, \
     ttft_ms, total_time_ms, itt_mean_ms, itt_std_ms, itt_min_ms, itt_max_ms, \
     itt_p50_ms, itt_p90_ms, itt_p99_ms, variance_coef, tokens_per_sec, num_chunks, \
     classified_backend, confidence, location, backend_evidence, speculative_decoding, speculative_type, \
     request_id, stop_reason, envoy_time_ms, cf_ray, cf_edge_location, \
     rl_5h_utilization, rl_5h_reset, rl_5h_status, rl_7d_utilization, rl_7d_reset, rl_7d_status, \
     rl_overall_status, rl_binding_window, rl_fallback_pct, rl_overage_status";

fn insert_sample(conn: &Connection, s: &Sample) -> Result<()> {
    conn.execute(
        "INSERT INTO samples (
            timestamp, session_id, model_requested, model_response, model_match,
            model_ui_selected, ui_api_mismatch, is_subagent, subagent_type,
            thinking_enabled, thinking_budget_requested, thinking_budget_tier, thinking_chunk_count,
            thinking_tokens_used, thinking_utilization, thinking_duration_ms, thinking_itt_mean_ms, thinking_itt_std_ms,
            text_chunk_count, text_duration_ms, text_itt_mean_ms, text_itt_std_ms,
            input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens, cache_efficiency,
            ttft_ms, total_time_ms, itt_mean_ms, itt_std_ms, itt_min_ms, itt_max_ms,
            itt_p50_ms, itt_p90_ms, itt_p99_ms, variance_coef, tokens_per_sec, num_chunks,
            classified_backend, confidence, location, backend_evidence, speculative_decoding, speculative_type,
            request_id, stop_reason, envoy_time_ms, cf_ray, cf_edge_location,
            rl_5h_utilization, rl_5h_reset, rl_5h_status, rl_7d_utilization, rl_7d_reset, rl_7d_status,
            rl_overall_status, rl_binding_window, rl_fallback_pct, rl_overage_status
        ) VALUES (
            ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
            ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
            ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
            ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
            ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
            ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
        )",
        params![
            s.timestamp,
            s.session_id,
            s.model_requested,
            s.model_response,
            s.model_match as i32,
            s.model_ui_selected,
            s.ui_api_mismatch as i32,
            s.is_subagent as i32,
            s.subagent_type,
            s.thinking_enabled as i32,
            s.thinking_budget_requested,
            s.thinking_budget_tier,
            s.thinking_chunk_count,
            s.thinking_tokens_used,
            s.thinking_utilization,
            s.thinking_duration_ms,
            s.thinking_itt_mean_ms,
            s.thinking_itt_std_ms,
            s.text_chunk_count,
            s.text_duration_ms,
            s.text_itt_mean_ms,
            s.text_itt_std_ms,
            s.input_tokens,
            s.output_tokens,
            s.cache_creation_tokens,
            s.cache_read_tokens,
            s.cache_efficiency,
            s.ttft_ms,
            s.total_time_ms,
            s.itt_mean_ms,
            s.itt_std_ms,
            s.itt_min_ms,
            s.itt_max_ms,
            s.itt_p50_ms,
            s.itt_p90_ms,
            s.itt_p99_ms,
            s.variance_coef,
            s.tokens_per_sec,
            s.num_chunks,
            s.classified_backend,
            s.confidence,
            s.location,
            s.backend_evidence,
            s.speculative_decoding as i32,
            s.speculative_type,
            s.request_id,
            s.stop_reason,
            s.envoy_time_ms,
            s.cf_ray,
            s.cf_edge_location,
            s.rl_5h_utilization,
            s.rl_5h_reset,
            s.rl_5h_status,
            s.rl_7d_utilization,
            s.rl_7d_reset,
            s.rl_7d_status,
            s.rl_overall_status,
            s.rl_binding_window,
            s.rl_fallback_pct,
            s.rl_overage_status,
        ],
    )?;
    Ok(())
}

fn row_to_sample(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sample> {
    Ok(Sample {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        session_id: row.get(2)?,
        model_requested: row.get(3)?,
        model_response: row.get(4)?,
        model_match: row.get::<_, i32>(5)? != 0,
        model_ui_selected: row.get(6)?,
        ui_api_mismatch: row.get::<_, i32>(7)? != 0,
        is_subagent: row.get::<_, i32>(8)? != 0,
        subagent_type: row.get(9)?,
        thinking_enabled: row.get::<_, i32>(10)? != 0,
        thinking_budget_requested: row.get(11)?,
        thinking_budget_tier: row.get(12)?,
        thinking_chunk_count: row.get(13)?,
        thinking_tokens_used: row.get(14)?,
        thinking_utilization: row.get(15)?,
        thinking_duration_ms: row.get(16)?,
        thinking_itt_mean_ms: row.get(17)?,
        thinking_itt_std_ms: row.get(18)?,
        text_chunk_count: row.get(19)?,
        text_duration_ms: row.get(20)?,
        text_itt_mean_ms: row.get(21)?,
        text_itt_std_ms: row.get(22)?,
        input_tokens: row.get(23)?,
        output_tokens: row.get(24)?,
        cache_creation_tokens: row.get(25)?,
        cache_read_tokens: row.get(26)?,
        cache_efficiency: row.get(27)?,
        ttft_ms: row.get(28)?,
        total_time_ms: row.get(29)?,
        itt_mean_ms: row.get(30)?,
        itt_std_ms: row.get(31)?,
        itt_min_ms: row.get(32)?,
        itt_max_ms: row.get(33)?,
        itt_p50_ms: row.get(34)?,
        itt_p90_ms: row.get(35)?,
        itt_p99_ms: row.get(36)?,
        variance_coef: row.get(37)?,
        tokens_per_sec: row.get(38)?,
        num_chunks: row.get(39)?,
        classified_backend: row.get(40)?,
        confidence: row.get(41)?,
        location: row.get(42)?,
        backend_evidence: row.get(43)?,
        speculative_decoding: row.get::<_, i32>(44)? != 0,
        speculative_type: row.get(45)?,
        request_id: row.get(46)?,
        stop_reason: row.get(47)?,
        envoy_time_ms: row.get(48)?,
        cf_ray: row.get(49)?,
        cf_edge_location: row.get(50)?,
        rl_5h_utilization: row.get(51)?,
        rl_5h_reset: row.get(52)?,
        rl_5h_status: row.get(53)?,
        rl_7d_utilization: row.get(54)?,
        rl_7d_reset: row.get(55)?,
        rl_7d_status: row.get(56)?,
        rl_overall_status: row.get(57)?,
        rl_binding_window: row.get(58)?,
        rl_fallback_pct: row.get(59)?,
        rl_overage_status: row.get(60)?,
    })
}

/// 重算单个模型的基线:最近 100 条样本,零值不进均值
fn update_model_stats(conn: &Connection, model: &str) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT itt_mean_ms, tokens_per_sec, ttft_ms, classified_backend, cache_efficiency, thinking_utilization
         FROM samples WHERE model_response = ?1 OR model_requested = ?1
         ORDER BY timestamp DESC LIMIT 100",
    )?;
    let rows = stmt
        .query_map([model], |row| {
            Ok((
                row.get::<_, f64>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, f64>(5)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if rows.is_empty() {
        return Ok(());
    }

    let itt_values: Vec<f64> = rows.iter().map(|r| r.0).filter(|v| *v != 0.0).collect();
    let tps_values: Vec<f64> = rows.iter().map(|r| r.1).filter(|v| *v != 0.0).collect();
    let ttft_values: Vec<f64> = rows.iter().map(|r| r.2).filter(|v| *v != 0.0).collect();
    let cache_values: Vec<f64> = rows.iter().map(|r| r.4).filter(|v| *v != 0.0).collect();
    let thinking_values: Vec<f64> = rows.iter().map(|r| r.5).filter(|v| *v != 0.0).collect();

    let trainium_count = rows.iter().filter(|r| r.3 == "trainium").count() as i64;
    let tpu_count = rows.iter().filter(|r| r.3 == "tpu").count() as i64;
    let gpu_count = rows.iter().filter(|r| r.3 == "gpu").count() as i64;
    let total = rows.len().max(1) as f64;

    conn.execute(
        "INSERT INTO model_stats (
            model, samples_count,
            itt_mean_baseline, itt_std_baseline, tps_baseline, ttft_baseline,
            trainium_count, tpu_count, gpu_count,
            trainium_pct, tpu_pct, gpu_pct,
            cache_efficiency_avg, cache_efficiency_min, cache_efficiency_max,
            thinking_utilization_avg, last_updated
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        ON CONFLICT(model) DO UPDATE SET
            samples_count = excluded.samples_count,
            itt_mean_baseline = excluded.itt_mean_baseline,
            itt_std_baseline = excluded.itt_std_baseline,
            tps_baseline = excluded.tps_baseline,
            ttft_baseline = excluded.ttft_baseline,
            trainium_count = excluded.trainium_count,
            tpu_count = excluded.tpu_count,
            gpu_count = excluded.gpu_count,
            trainium_pct = excluded.trainium_pct,
            tpu_pct = excluded.tpu_pct,
            gpu_pct = excluded.gpu_pct,
            cache_efficiency_avg = excluded.cache_efficiency_avg,
            cache_efficiency_min = excluded.cache_efficiency_min,
            cache_efficiency_max = excluded.cache_efficiency_max,
            thinking_utilization_avg = excluded.thinking_utilization_avg,
            last_updated = excluded.last_updated",
        params![
            model,
            rows.len() as i64,
            mean(&itt_values),
            sample_stdev(&itt_values),
            mean(&tps_values),
            mean(&ttft_values),
            trainium_count,
            tpu_count,
            gpu_count,
            trainium_count as f64 / total * 100.0,
            tpu_count as f64 / total * 100.0,
            gpu_count as f64 / total * 100.0,
            mean(&cache_values),
            fold_min(&cache_values),
            fold_max(&cache_values),
            mean(&thinking_values),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// 重算单个会话的汇总:按时间重放全部样本
fn update_session_stats(conn: &Connection, session_id: &str) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT timestamp, model_requested, model_match, is_subagent, subagent_type,
                classified_backend, itt_mean_ms, cache_efficiency
         FROM samples WHERE session_id = ?1 ORDER BY timestamp",
    )?;
    let rows = stmt
        .query_map([session_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i32>(2)? != 0,
                row.get::<_, i32>(3)? != 0,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, f64>(6)?,
                row.get::<_, f64>(7)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if rows.is_empty() {
        return Ok(());
    }

    let direct_count = rows.iter().filter(|r| r.2).count() as i64;
    let subagent_count = rows.iter().filter(|r| r.3).count() as i64;
    let haiku_count = rows.iter().filter(|r| r.4.as_deref() == Some("haiku")).count() as i64;
    let sonnet_count = rows.iter().filter(|r| r.4.as_deref() == Some("sonnet")).count() as i64;

    let trainium_count = rows.iter().filter(|r| r.5 == "trainium").count() as i64;
    let tpu_count = rows.iter().filter(|r| r.5 == "tpu").count() as i64;
    let gpu_count = rows.iter().filter(|r| r.5 == "gpu").count() as i64;

    // unknown 是缺数据,不算一次真实切换
    let mut backend_switches = 0i64;
    let mut prev: Option<&str> = None;
    for row in &rows {
        let backend = row.5.as_str();
        if backend == "unknown" {
            continue;
        }
        if let Some(p) = prev
            && backend != p
        {
            backend_switches += 1;
        }
        prev = Some(backend);
    }

    let itt_values: Vec<f64> = rows.iter().map(|r| r.6).filter(|v| *v != 0.0).collect();
    let itt_start = itt_values.first().copied().unwrap_or(0.0);
    let itt_end = itt_values.last().copied().unwrap_or(0.0);
    let itt_trend_pct = if itt_start != 0.0 {
        (itt_end - itt_start) / itt_start * 100.0
    } else {
        0.0
    };
    let itt_trend_direction = if itt_trend_pct > 5.0 {
        "rising"
    } else if itt_trend_pct < -5.0 {
        "falling"
    } else {
        "stable"
    };

    let cache_values: Vec<f64> = rows
        .iter()
        .map(|r| r.7)
        .filter(|v| *v != 0.0 && (0.0..=100.0).contains(v))
        .collect();

    conn.execute(
        "INSERT INTO session_stats (
            session_id, start_time, end_time, sample_count,
            picker_model, direct_count, subagent_count, haiku_count, sonnet_count,
            itt_mean_start, itt_mean_end, itt_trend_pct, itt_trend_direction,
            trainium_count, gpu_count, tpu_count, backend_switches,
            cache_efficiency_avg, last_updated
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
        ON CONFLICT(session_id) DO UPDATE SET
            end_time = excluded.end_time,
            sample_count = excluded.sample_count,
            direct_count = excluded.direct_count,
            subagent_count = excluded.subagent_count,
            haiku_count = excluded.haiku_count,
            sonnet_count = excluded.sonnet_count,
            itt_mean_end = excluded.itt_mean_end,
            itt_trend_pct = excluded.itt_trend_pct,
            itt_trend_direction = excluded.itt_trend_direction,
            trainium_count = excluded.trainium_count,
            gpu_count = excluded.gpu_count,
            tpu_count = excluded.tpu_count,
            backend_switches = excluded.backend_switches,
            cache_efficiency_avg = excluded.cache_efficiency_avg,
            last_updated = excluded.last_updated",
        params![
            session_id,
            rows[0].0,
            rows[rows.len() - 1].0,
            rows.len() as i64,
            rows[0].1,
            direct_count,
            subagent_count,
            haiku_count,
            sonnet_count,
            itt_start,
            itt_end,
            itt_trend_pct,
            itt_trend_direction,
            trainium_count,
            gpu_count,
            tpu_count,
            backend_switches,
            mean(&cache_values),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn sample_stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

fn fold_min(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().copied().fold(f64::INFINITY, f64::min)
    }
}

fn fold_max(values: &[f64]) -> f64 {
    values.iter().copied().fold(0.0, f64::max)
}

/// 异步样本服务(公开 API)
pub struct TelemetryService {
    sender: mpsc::Sender<Sample>,
    store: Arc<SampleStore>,
}

impl TelemetryService {
    /// 创建服务并启动后台写入任务
    pub fn new(db_path: &str) -> Result<Self> {
        let store = Arc::new(SampleStore::new(db_path)?);
        let (sender, mut receiver) = mpsc::channel::<Sample>(4096);

        let write_store = store.clone();
        tokio::spawn(async move {
            while let Some(first) = receiver.recv().await {
                let mut batch = vec![first];
                while let Ok(sample) = receiver.try_recv() {
                    batch.push(sample);
                    if batch.len() >= 100 {
                        break;
                    }
                }
                let store = write_store.clone();
                let _ = tokio::task::spawn_blocking(move || {
                    for sample in &batch {
                        match store.add_sample(sample) {
                            Ok((backend, confidence)) => tracing::debug!(
                                "样本已落库: {} {} {:.1}%",
                                sample.model_response,
                                backend,
                                confidence
                            ),
                            Err(e) => tracing::error!("样本写入失败: {}", e),
                        }
                    }
                })
                .await;
            }
        });

        Ok(Self { sender, store })
    }

    /// 非阻塞提交样本(发送到 channel)
    pub fn submit(&self, sample: Sample) {
        if self.sender.try_send(sample).is_err() {
            tracing::warn!("样本通道已满,丢弃样本");
        }
    }

    /// 查询样本列表
    pub async fn query(&self, filter: SampleQuery) -> Result<SampleListResponse> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.query(&filter)).await?
    }

    /// 最新一条样本
    pub async fn latest(&self) -> Result<Option<Sample>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.latest()).await?
    }

    /// 总览统计
    pub async fn get_stats(&self) -> Result<OverviewStats> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.get_stats()).await?
    }

    /// 各模型基线
    pub async fn model_stats(&self) -> Result<Vec<ModelStatsRow>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.model_stats()).await?
    }

    /// 各会话汇总
    pub async fn session_stats(&self) -> Result<Vec<SessionStatsRow>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.session_stats()).await?
    }

    /// 清空全部数据
    pub async fn clear(&self) -> Result<u64> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.clear()).await?
    }
}
