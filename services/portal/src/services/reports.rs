use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};

use village_health_common::AppError;
use village_health_database::Problem;

use crate::services::{AppState, ProblemService};

/// Inclusive range of calendar days (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl DateRange {
    pub const DEFAULT_DAYS: i64 = 30;

    /// Missing ends default to the last 30 days through `today`.
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>, today: NaiveDate) -> Result<Self, AppError> {
        let end_date = end.unwrap_or(today);
        if end_date.succ_opt().is_none() {
            return Err(out_of_range());
        }
        let start_date = match start {
            Some(date) => date,
            None => end_date
                .checked_sub_signed(Duration::days(Self::DEFAULT_DAYS))
                .ok_or_else(out_of_range)?,
        };
        if start_date > end_date {
            return Err(AppError::Validation("Start date must not be after end date".to_string()));
        }
        Ok(Self { start_date, end_date })
    }

    /// First instant of the range.
    pub fn starts_at(&self) -> DateTime<Utc> {
        self.start_date.and_time(NaiveTime::default()).and_utc()
    }

    /// First instant after the range; the end date is inclusive.
    pub fn ends_before(&self) -> DateTime<Utc> {
        self.end_date
            .succ_opt()
            .unwrap_or(NaiveDate::MAX)
            .and_time(NaiveTime::default())
            .and_utc()
    }
}

fn out_of_range() -> AppError {
    AppError::InvalidArgument("Date is out of range".to_string())
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct CountRow {
    pub label: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AvmsPerformance {
    pub id: i64,
    pub name: String,
    pub village: Option<String>,
    pub assigned: i64,
    pub resolved: i64,
    pub avg_resolution_hours: Option<f64>,
    #[sqlx(skip)]
    pub resolution_rate: f64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct DoctorPerformance {
    pub id: i64,
    pub name: String,
    pub escalations: i64,
    pub responses: i64,
    pub resolved: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub range: DateRange,
    pub total_problems: i64,
    pub resolved_problems: i64,
    pub by_status: Vec<CountRow>,
    pub by_priority: Vec<CountRow>,
    pub by_category: Vec<CountRow>,
    pub by_village: Vec<CountRow>,
    pub avms_performance: Vec<AvmsPerformance>,
    pub doctor_performance: Vec<DoctorPerformance>,
}

pub const CSV_COLUMNS: [&str; 13] = [
    "id",
    "title",
    "villager",
    "village",
    "category",
    "priority",
    "status",
    "assigned_to",
    "escalated_to",
    "location",
    "created_at",
    "updated_at",
    "resolved_at",
];

pub struct ReportService {
    db_pool: PgPool,
    problems: ProblemService,
}

impl ReportService {
    pub fn new(state: &AppState) -> Self {
        Self {
            db_pool: state.db_pool.clone(),
            problems: ProblemService::new(state),
        }
    }

    pub async fn summary(&self, range: DateRange) -> Result<ReportSummary, AppError> {
        let (total_problems, resolved_problems) = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE status IN ('resolved', 'completed', 'closed'))
            FROM problems
            WHERE created_at >= $1 AND created_at < $2
            "#,
        )
        .bind(range.starts_at())
        .bind(range.ends_before())
        .fetch_one(&self.db_pool)
        .await?;

        let by_status = self.grouped("p.status", range).await?;
        let by_priority = self.grouped("p.priority", range).await?;
        let by_category = self.grouped("COALESCE(NULLIF(p.category, ''), 'uncategorized')", range).await?;
        let by_village = self.grouped("COALESCE(NULLIF(v.village, ''), 'unknown')", range).await?;

        Ok(ReportSummary {
            range,
            total_problems,
            resolved_problems,
            by_status,
            by_priority,
            by_category,
            by_village,
            avms_performance: self.avms_performance(range).await?,
            doctor_performance: self.doctor_performance(range).await?,
        })
    }

    /// `expression` is one of the fixed grouping columns above, never user input.
    async fn grouped(&self, expression: &str, range: DateRange) -> Result<Vec<CountRow>, AppError> {
        let sql = format!(
            r#"
            SELECT {expr} AS label, COUNT(*) AS count
            FROM problems p
            JOIN users v ON v.id = p.villager_id
            WHERE p.created_at >= $1 AND p.created_at < $2
            GROUP BY 1
            ORDER BY count DESC, label ASC
            "#,
            expr = expression
        );

        Ok(sqlx::query_as::<_, CountRow>(&sql)
            .bind(range.starts_at())
            .bind(range.ends_before())
            .fetch_all(&self.db_pool)
            .await?)
    }

    pub async fn avms_performance(&self, range: DateRange) -> Result<Vec<AvmsPerformance>, AppError> {
        let mut rows = sqlx::query_as::<_, AvmsPerformance>(
            r#"
            SELECT u.id, u.name, u.village,
                   COUNT(p.id) AS assigned,
                   COUNT(p.id) FILTER (WHERE p.status IN ('resolved', 'completed', 'closed')) AS resolved,
                   (AVG(EXTRACT(EPOCH FROM (COALESCE(p.resolved_at, p.updated_at) - p.created_at)) / 3600.0)
                       FILTER (WHERE p.status IN ('resolved', 'completed', 'closed')))::float8 AS avg_resolution_hours
            FROM users u
            LEFT JOIN problems p
                   ON p.assigned_to = u.id AND p.created_at >= $1 AND p.created_at < $2
            WHERE u.role = 'avms' AND u.status = 'active'
            GROUP BY u.id, u.name, u.village
            ORDER BY resolved DESC, u.name ASC
            "#,
        )
        .bind(range.starts_at())
        .bind(range.ends_before())
        .fetch_all(&self.db_pool)
        .await?;

        for row in &mut rows {
            row.resolution_rate = resolution_rate(row.resolved, row.assigned);
            row.avg_resolution_hours = row.avg_resolution_hours.map(round_one_decimal);
        }
        Ok(rows)
    }

    pub async fn doctor_performance(&self, range: DateRange) -> Result<Vec<DoctorPerformance>, AppError> {
        Ok(sqlx::query_as::<_, DoctorPerformance>(
            r#"
            SELECT u.id, u.name,
                   (SELECT COUNT(*) FROM problems p
                     WHERE p.escalated_to = u.id AND p.created_at >= $1 AND p.created_at < $2) AS escalations,
                   (SELECT COUNT(*) FROM medical_responses mr
                     WHERE mr.doctor_id = u.id AND mr.created_at >= $1 AND mr.created_at < $2) AS responses,
                   (SELECT COUNT(*) FROM problems p
                     WHERE p.escalated_to = u.id AND p.status IN ('resolved', 'completed', 'closed')
                       AND p.created_at >= $1 AND p.created_at < $2) AS resolved
            FROM users u
            WHERE u.role = 'doctor' AND u.status = 'active'
            ORDER BY responses DESC, u.name ASC
            "#,
        )
        .bind(range.starts_at())
        .bind(range.ends_before())
        .fetch_all(&self.db_pool)
        .await?)
    }

    /// One CSV row per problem over the unfiltered problem list.
    pub async fn export_csv(&self) -> Result<(Vec<u8>, usize), AppError> {
        let problems = self.problems.export_all().await?;
        let bytes = write_csv(&problems)?;
        tracing::info!("Exported {} problems to CSV", problems.len());
        Ok((bytes, problems.len()))
    }
}

/// Percentage of assigned problems that were resolved, to one decimal place.
/// Zero when nothing was assigned.
pub fn resolution_rate(resolved: i64, assigned: i64) -> f64 {
    if assigned <= 0 {
        return 0.0;
    }
    round_one_decimal(resolved as f64 / assigned as f64 * 100.0)
}

fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn format_time(value: &DateTime<Utc>) -> String {
    value.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn write_csv(problems: &[Problem]) -> Result<Vec<u8>, AppError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(CSV_COLUMNS)
        .map_err(|e| AppError::Internal(format!("Failed to write CSV header: {}", e)))?;

    for p in problems {
        writer
            .write_record([
                p.id.to_string(),
                p.title.clone(),
                p.villager_name.clone().unwrap_or_default(),
                p.village.clone().unwrap_or_default(),
                p.category.clone().unwrap_or_default(),
                p.priority.clone(),
                p.status.clone(),
                p.assigned_to_name.clone().unwrap_or_default(),
                p.escalated_to_name.clone().unwrap_or_default(),
                p.location.clone().unwrap_or_default(),
                format_time(&p.created_at),
                format_time(&p.updated_at),
                p.resolved_at.as_ref().map(format_time).unwrap_or_default(),
            ])
            .map_err(|e| AppError::Internal(format!("Failed to write CSV row: {}", e)))?;
    }

    writer
        .into_inner()
        .map_err(|e| AppError::Internal(format!("Failed to finish CSV: {}", e)))
}

pub fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn count_table(title: &str, rows: &[CountRow]) -> String {
    let mut html = format!("<h2>{}</h2>\n<table>\n<tr><th>Name</th><th>Problems</th></tr>\n", escape_html(title));
    for row in rows {
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td></tr>\n",
            escape_html(&row.label),
            row.count
        ));
    }
    html.push_str("</table>\n");
    html
}

/// Print-styled HTML page that opens the browser's print dialog on load.
pub fn render_printable(site_name: &str, summary: &ReportSummary, generated_at: DateTime<Utc>) -> String {
    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\n");
    html.push_str(&format!("<title>{} report</title>\n", escape_html(site_name)));
    html.push_str(
        "<style>body{font-family:sans-serif;margin:2em}table{border-collapse:collapse;margin-bottom:1.5em}\
         th,td{border:1px solid #999;padding:4px 8px;text-align:left}@media print{.no-print{display:none}}</style>\n",
    );
    html.push_str("</head><body onload=\"window.print()\">\n");
    html.push_str(&format!("<h1>{} report</h1>\n", escape_html(site_name)));
    html.push_str(&format!(
        "<p>Period {} to {}. Generated {}.</p>\n",
        summary.range.start_date,
        summary.range.end_date,
        format_time(&generated_at)
    ));
    html.push_str(&format!(
        "<p>Total problems: {}. Resolved: {}.</p>\n",
        summary.total_problems, summary.resolved_problems
    ));

    html.push_str(&count_table("By status", &summary.by_status));
    html.push_str(&count_table("By priority", &summary.by_priority));
    html.push_str(&count_table("By category", &summary.by_category));
    html.push_str(&count_table("By village", &summary.by_village));

    html.push_str("<h2>AVMS performance</h2>\n<table>\n<tr><th>Officer</th><th>Assigned</th><th>Resolved</th><th>Rate %</th><th>Avg hours</th></tr>\n");
    for row in &summary.avms_performance {
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{:.1}</td><td>{}</td></tr>\n",
            escape_html(&row.name),
            row.assigned,
            row.resolved,
            row.resolution_rate,
            row.avg_resolution_hours.map(|h| format!("{:.1}", h)).unwrap_or_else(|| "-".to_string())
        ));
    }
    html.push_str("</table>\n");

    html.push_str("<h2>Doctor performance</h2>\n<table>\n<tr><th>Doctor</th><th>Escalations</th><th>Responses</th><th>Resolved</th></tr>\n");
    for row in &summary.doctor_performance {
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape_html(&row.name),
            row.escalations,
            row.responses,
            row.resolved
        ));
    }
    html.push_str("</table>\n");

    html.push_str("<p class=\"no-print\"><a href=\"/admin/reports\">Back to reports</a></p>\n</body></html>\n");
    html
}
